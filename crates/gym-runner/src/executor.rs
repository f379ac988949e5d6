use chrono::Local;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::artifacts::{create_run_dir, record_error, write_completed, write_started};
use crate::attempt::{AttemptState, AttemptStateGuard, RunAttempt};
use crate::config::GymConfig;
use crate::error::{AttemptError, Role};
use crate::planner::{Pairing, RunWorkItem};
use crate::ports::PortAllocator;
use crate::progress::{notify, Notice, Position};
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// Mount point of the shared results tree inside target containers.
pub const CONTAINER_RESULTS_PATH: &str = "/results/";

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub ordinal: u32,
    pub run_id: Option<String>,
    pub run_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub state: AttemptState,
    pub failure: Option<AttemptError>,
    pub transitions: Vec<AttemptState>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.state == AttemptState::Completed
    }
}

#[derive(Debug, Clone)]
pub struct WorkItemReport {
    pub item: RunWorkItem,
    pub position: Position,
    pub attempts: Vec<AttemptReport>,
}

impl WorkItemReport {
    pub fn completed(&self) -> bool {
        self.attempts.last().is_some_and(AttemptReport::succeeded)
    }
}

pub fn container_name(role: Role, pairing: &Pairing, run_id: &str) -> String {
    match role {
        Role::Target => format!("{}_for_{}_{}", pairing.target, pairing.exerciser, run_id),
        Role::Exerciser => format!("{}_for_{}_{}", pairing.exerciser, pairing.target, run_id),
    }
}

/// Identifiers handed to both containers so the images and the capture
/// addon can find the shared run directory.
pub fn container_env(pairing: &Pairing, run_id: &str, port: u16) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("API".to_string(), pairing.target.clone());
    env.insert("TOOL".to_string(), pairing.exerciser.clone());
    env.insert("RUN".to_string(), run_id.to_string());
    env.insert("PORT".to_string(), port.to_string());
    env
}

/// Drives work items through the attempt lifecycle, retrying failed
/// attempts up to `max_attempts` times.
pub struct RunExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<GymConfig>,
    results_root: PathBuf,
    ports: PortAllocator,
}

impl RunExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<GymConfig>,
        results_root: PathBuf,
    ) -> Self {
        let ports = PortAllocator::from_config(&config);
        Self {
            runtime,
            config,
            results_root,
            ports,
        }
    }

    pub fn execute(&self, item: &RunWorkItem, position: Position) -> WorkItemReport {
        let max_attempts = self.config.max_attempts;
        let mut attempts = Vec::new();
        for ordinal in 1..=max_attempts {
            let report = self.run_attempt(item, ordinal, position);
            let succeeded = report.succeeded();
            attempts.push(report);
            if succeeded {
                break;
            }
            if ordinal < max_attempts {
                thread::sleep(self.config.retry_pause());
            } else {
                error!(pairing = %item.pairing, attempts = max_attempts, "work item exhausted its attempts");
                notify(
                    Notice::Error,
                    position,
                    &format!(
                        "Run of {} terminated with errors after {} attempts.",
                        item.pairing, max_attempts
                    ),
                );
            }
        }
        WorkItemReport {
            item: item.clone(),
            position,
            attempts,
        }
    }

    pub fn run_attempt(&self, item: &RunWorkItem, ordinal: u32, position: Position) -> AttemptReport {
        let pairing = &item.pairing;
        let (run_id, run_dir) = match self.create_attempt_dir(pairing) {
            Ok(created) => created,
            Err(err) => return provisioning_failure(pairing, ordinal, position, None, err),
        };
        // From here on failures are recorded in the run directory.
        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(err) => {
                if let Err(io_err) = record_error(&run_dir, &err) {
                    error!(run_id = %run_id, error = %io_err, "could not append to errors file");
                }
                return provisioning_failure(pairing, ordinal, position, Some((run_id, run_dir)), err);
            }
        };

        let attempt = RunAttempt {
            run_id,
            port,
            ordinal,
            run_dir,
            state: AttemptState::Provisioning,
        };
        let mut guard = AttemptStateGuard::new(&attempt, pairing);
        guard.record(AttemptState::Provisioning, None);
        let mut lifecycle = Lifecycle {
            executor: self,
            pairing,
            position,
            attempt,
            guard,
            transitions: vec![AttemptState::Pending, AttemptState::Provisioning],
            target_up: false,
            exerciser_up: false,
        };

        let notice = if ordinal == 1 { Notice::Start } else { Notice::Retry };
        notify(
            notice,
            position,
            &format!(
                "Running {} ({}) with API on port {}, attempt {}/{}.",
                pairing,
                lifecycle.attempt.run_id,
                port,
                ordinal,
                self.config.max_attempts
            ),
        );
        if let Err(err) = write_started(&lifecycle.attempt.run_dir) {
            let path = lifecycle.attempt.run_dir.display().to_string();
            return lifecycle.fail(AttemptError::Artifact {
                path,
                message: err.to_string(),
            });
        }
        lifecycle.run()
    }

    fn create_attempt_dir(&self, pairing: &Pairing) -> Result<(String, PathBuf), AttemptError> {
        let base_id = format!("run-{}", Local::now().format("%Y%m%d-%H%M%S"));
        let pairing_dir = pairing.results_dir(&self.results_root);
        create_run_dir(&pairing_dir, &base_id).map_err(|e| AttemptError::Provisioning {
            path: pairing_dir.join(&base_id).display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn container_spec(&self, role: Role, pairing: &Pairing, attempt: &RunAttempt) -> ContainerSpec {
        let id = match role {
            Role::Target => &pairing.target,
            Role::Exerciser => &pairing.exerciser,
        };
        let mut spec = ContainerSpec {
            name: container_name(role, pairing, &attempt.run_id),
            image: self.config.image_name(id),
            env: container_env(pairing, &attempt.run_id, attempt.port),
            memory: Some(self.config.container_memory.clone()),
            cpus: Some(self.config.container_cpus),
            ..ContainerSpec::default()
        };
        match role {
            Role::Target => {
                spec.ports = vec![(attempt.port, self.config.target_container_port)];
                spec.volumes = vec![format!(
                    "{}/:{}",
                    self.results_root.display(),
                    CONTAINER_RESULTS_PATH
                )];
                spec.user = Some("root".to_string());
            }
            Role::Exerciser => {
                spec.privileged = true;
                spec.network = Some("host".to_string());
            }
        }
        spec
    }
}

fn provisioning_failure(
    pairing: &Pairing,
    ordinal: u32,
    position: Position,
    created: Option<(String, PathBuf)>,
    err: AttemptError,
) -> AttemptReport {
    error!(pairing = %pairing, attempt = ordinal, error = %err, "provisioning failed");
    notify(
        Notice::Error,
        position,
        &format!("Could not provision run of {}: {}", pairing, err),
    );
    let (run_id, run_dir) = created.unzip();
    AttemptReport {
        ordinal,
        run_id,
        run_dir,
        port: None,
        state: AttemptState::Failed,
        failure: Some(err),
        transitions: vec![
            AttemptState::Pending,
            AttemptState::Provisioning,
            AttemptState::Failed,
        ],
    }
}

/// One attempt in flight. Tracks which containers it has started so the
/// failure path can stop whatever is still up.
struct Lifecycle<'a> {
    executor: &'a RunExecutor,
    pairing: &'a Pairing,
    position: Position,
    attempt: RunAttempt,
    guard: AttemptStateGuard,
    transitions: Vec<AttemptState>,
    target_up: bool,
    exerciser_up: bool,
}

impl Lifecycle<'_> {
    fn run(mut self) -> AttemptReport {
        match self.drive() {
            Ok(()) => self.complete(),
            Err(err) => self.fail(err),
        }
    }

    fn drive(&mut self) -> Result<(), AttemptError> {
        let config = Arc::clone(&self.executor.config);

        self.enter(AttemptState::TargetStarting);
        self.verify_images()?;
        self.start(Role::Target)?;

        self.enter(AttemptState::WarmingUp);
        thread::sleep(config.warmup());

        self.enter(AttemptState::ExerciserStarting);
        self.start(Role::Exerciser)?;
        thread::sleep(config.exerciser_settle());

        self.enter(AttemptState::Monitoring);
        self.monitor(&config)?;

        self.enter(AttemptState::TearingDown);
        self.stop(Role::Exerciser)?;
        // Give the target time to flush captured traffic to the volume.
        thread::sleep(config.flush_grace());
        self.stop(Role::Target)
    }

    fn transition(&mut self, state: AttemptState, failure: Option<&str>) {
        if self.attempt.state == state {
            return;
        }
        debug!(
            run_id = %self.attempt.run_id,
            from = %self.attempt.state,
            to = %state,
            "attempt transition"
        );
        self.attempt.state = state;
        self.transitions.push(state);
        self.guard.record(state, failure);
    }

    fn enter(&mut self, state: AttemptState) {
        self.transition(state, None);
    }

    fn verify_images(&self) -> Result<(), AttemptError> {
        let runtime = &self.executor.runtime;
        let mut missing = Vec::new();
        for id in [&self.pairing.target, &self.pairing.exerciser] {
            let image = self.executor.config.image_name(id);
            match runtime.image_exists(&image) {
                Ok(true) => {}
                Ok(false) => missing.push(image),
                Err(err) => {
                    return Err(AttemptError::Runtime {
                        operation: format!("image check for {}", image),
                        message: err.to_string(),
                    })
                }
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        notify(
            Notice::Error,
            self.position,
            &format!(
                "Execution failed for {}. Missing container image(s). Have you built them?",
                self.pairing
            ),
        );
        Err(AttemptError::ImageMissing { images: missing })
    }

    fn set_up(&mut self, role: Role, up: bool) {
        match role {
            Role::Target => self.target_up = up,
            Role::Exerciser => self.exerciser_up = up,
        }
    }

    fn is_up(&self, role: Role) -> bool {
        match role {
            Role::Target => self.target_up,
            Role::Exerciser => self.exerciser_up,
        }
    }

    fn start(&mut self, role: Role) -> Result<(), AttemptError> {
        let spec = self.executor.container_spec(role, self.pairing, &self.attempt);
        match self.executor.runtime.run_detached(&spec) {
            Ok(()) => {
                debug!(run_id = %self.attempt.run_id, container = %spec.name, "container started");
                self.set_up(role, true);
                Ok(())
            }
            Err(err) => Err(AttemptError::ContainerStart {
                role,
                name: spec.name,
                message: err.to_string(),
            }),
        }
    }

    fn monitor(&mut self, config: &GymConfig) -> Result<(), AttemptError> {
        for interval in 1..=config.health_checks {
            thread::sleep(config.health_interval());
            for role in [Role::Target, Role::Exerciser] {
                if let Err(message) = self.check_alive(role) {
                    self.set_up(role, false);
                    notify(
                        Notice::Error,
                        self.position,
                        &format!(
                            "The {} container of {} ({}) stopped at interval {}.",
                            role, self.pairing, self.attempt.run_id, interval
                        ),
                    );
                    return Err(AttemptError::HealthCheck {
                        role,
                        interval,
                        message,
                    });
                }
            }
            debug!(run_id = %self.attempt.run_id, interval, "both containers alive");
        }
        Ok(())
    }

    fn check_alive(&self, role: Role) -> Result<(), String> {
        let name = container_name(role, self.pairing, &self.attempt.run_id);
        match self.executor.runtime.status(&name) {
            Ok(status) if status.is_alive() => Ok(()),
            Ok(status) => Err(format!("container {}", status)),
            Err(err) => Err(err.to_string()),
        }
    }

    fn stop(&mut self, role: Role) -> Result<(), AttemptError> {
        self.set_up(role, false);
        let name = container_name(role, self.pairing, &self.attempt.run_id);
        self.executor
            .runtime
            .stop(&name)
            .map_err(|err| AttemptError::Teardown {
                role,
                name,
                message: err.to_string(),
            })
    }

    /// Cascading stop after a failure: whatever is still up goes down,
    /// exerciser first. Errors here are logged and otherwise ignored.
    fn stop_survivors(&mut self) {
        for role in [Role::Exerciser, Role::Target] {
            if !self.is_up(role) {
                continue;
            }
            if let Err(err) = self.stop(role) {
                warn!(run_id = %self.attempt.run_id, error = %err, "cleanup stop failed");
            }
        }
    }

    fn complete(mut self) -> AttemptReport {
        if let Err(err) = write_completed(&self.attempt.run_dir) {
            let path = self.attempt.run_dir.display().to_string();
            return self.fail(AttemptError::Artifact {
                path,
                message: err.to_string(),
            });
        }
        self.enter(AttemptState::Completed);
        info!(run_id = %self.attempt.run_id, pairing = %self.pairing, "run completed");
        notify(
            Notice::End,
            self.position,
            &format!("Run of {} ({}) completed.", self.pairing, self.attempt.run_id),
        );
        self.report(None)
    }

    fn fail(mut self, err: AttemptError) -> AttemptReport {
        warn!(
            run_id = %self.attempt.run_id,
            pairing = %self.pairing,
            state = %self.attempt.state,
            kind = err.kind(),
            error = %err,
            "attempt failed"
        );
        let nothing_started = self.attempt.state == AttemptState::TargetStarting;
        self.enter(AttemptState::TearingDown);
        // Survivors are stopped before the failure is recorded.
        self.stop_survivors();
        if let Err(io_err) = record_error(&self.attempt.run_dir, &err) {
            error!(run_id = %self.attempt.run_id, error = %io_err, "could not append to errors file");
        }
        if nothing_started {
            // Shortened warm-up: no traffic will flow.
            thread::sleep(self.executor.config.failed_warmup());
        }
        let message = err.to_string();
        self.transition(AttemptState::Failed, Some(&message));
        self.report(Some(err))
    }

    fn report(self, failure: Option<AttemptError>) -> AttemptReport {
        AttemptReport {
            ordinal: self.attempt.ordinal,
            run_id: Some(self.attempt.run_id.clone()),
            run_dir: Some(self.attempt.run_dir.clone()),
            port: Some(self.attempt.port),
            state: self.attempt.state,
            failure,
            transitions: self.transitions,
        }
    }
}
