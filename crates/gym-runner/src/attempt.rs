use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::artifacts::{atomic_write_json_pretty, ATTEMPT_STATE_FILE};
use crate::planner::Pairing;

/// Lifecycle of one run attempt. Transitions are strictly sequential; any
/// non-terminal state may jump to `TearingDown` and then `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Provisioning,
    TargetStarting,
    WarmingUp,
    ExerciserStarting,
    Monitoring,
    TearingDown,
    Completed,
    Failed,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Provisioning => "provisioning",
            AttemptState::TargetStarting => "target_starting",
            AttemptState::WarmingUp => "warming_up",
            AttemptState::ExerciserStarting => "exerciser_starting",
            AttemptState::Monitoring => "monitoring",
            AttemptState::TearingDown => "tearing_down",
            AttemptState::Completed => "completed",
            AttemptState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::Failed)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunAttempt {
    pub run_id: String,
    pub port: u16,
    pub ordinal: u32,
    pub run_dir: PathBuf,
    pub state: AttemptState,
}

/// Keeps `attempt_state.json` in the run directory in step with the
/// attempt. If it is dropped before a terminal state was recorded the file
/// is left saying `failed`.
pub(crate) struct AttemptStateGuard {
    run_dir: PathBuf,
    run_id: String,
    pairing: Pairing,
    ordinal: u32,
    port: u16,
    done: bool,
}

impl AttemptStateGuard {
    pub(crate) fn new(attempt: &RunAttempt, pairing: &Pairing) -> Self {
        Self {
            run_dir: attempt.run_dir.clone(),
            run_id: attempt.run_id.clone(),
            pairing: pairing.clone(),
            ordinal: attempt.ordinal,
            port: attempt.port,
            done: false,
        }
    }

    pub(crate) fn record(&mut self, state: AttemptState, failure: Option<&str>) {
        if let Err(err) = write_attempt_state(
            &self.run_dir,
            &self.run_id,
            &self.pairing,
            self.ordinal,
            self.port,
            state,
            failure,
        ) {
            warn!(run_id = %self.run_id, error = %err, "could not record attempt state");
        }
        if state.is_terminal() {
            self.done = true;
        }
    }
}

impl Drop for AttemptStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_attempt_state(
                &self.run_dir,
                &self.run_id,
                &self.pairing,
                self.ordinal,
                self.port,
                AttemptState::Failed,
                Some("aborted"),
            );
        }
    }
}

fn write_attempt_state(
    run_dir: &Path,
    run_id: &str,
    pairing: &Pairing,
    ordinal: u32,
    port: u16,
    state: AttemptState,
    failure: Option<&str>,
) -> anyhow::Result<()> {
    let payload = json!({
        "schema_version": "attempt_state_v1",
        "run_id": run_id,
        "target": pairing.target,
        "exerciser": pairing.exerciser,
        "attempt": ordinal,
        "port": port,
        "state": state,
        "failure": failure,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join(ATTEMPT_STATE_FILE), &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use serde_json::Value;
    use std::fs;

    fn read_state(dir: &Path) -> Value {
        serde_json::from_slice(&fs::read(dir.join(ATTEMPT_STATE_FILE)).expect("read state"))
            .expect("parse state")
    }

    fn attempt_in(dir: &Path) -> RunAttempt {
        RunAttempt {
            run_id: "run-20240101-000000".to_string(),
            port: 12345,
            ordinal: 2,
            run_dir: dir.to_path_buf(),
            state: AttemptState::Pending,
        }
    }

    #[test]
    fn guard_tracks_transitions() {
        let root = temp_root("attempt_guard_transitions");
        let pairing = Pairing::new("blog", "fuzzer");
        let mut guard = AttemptStateGuard::new(&attempt_in(&root), &pairing);
        guard.record(AttemptState::Monitoring, None);
        let state = read_state(&root);
        assert_eq!(state["state"], "monitoring");
        assert_eq!(state["target"], "blog");
        assert_eq!(state["attempt"], 2);
        guard.record(AttemptState::Completed, None);
        drop(guard);
        assert_eq!(read_state(&root)["state"], "completed");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dropped_guard_marks_attempt_failed() {
        let root = temp_root("attempt_guard_drop");
        let pairing = Pairing::new("blog", "fuzzer");
        let mut guard = AttemptStateGuard::new(&attempt_in(&root), &pairing);
        guard.record(AttemptState::WarmingUp, None);
        drop(guard);
        let state = read_state(&root);
        assert_eq!(state["state"], "failed");
        assert_eq!(state["failure"], "aborted");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(AttemptState::Completed.is_terminal());
        assert!(AttemptState::Failed.is_terminal());
        assert!(!AttemptState::TearingDown.is_terminal());
        assert_eq!(AttemptState::ExerciserStarting.to_string(), "exerciser_starting");
    }
}
