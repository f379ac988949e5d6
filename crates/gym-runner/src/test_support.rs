use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

use crate::artifacts::ERRORS_FILE;
use crate::config::GymConfig;
use crate::resources::{ResourceProbe, ResourceSnapshot};
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus};

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn temp_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "restgym_{}_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros(),
        TEMP_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir
}

/// Defaults with every wait set to zero and a fixed scheduler seed.
pub(crate) fn instant_config() -> GymConfig {
    GymConfig {
        gate_sample_interval_secs: 0,
        gate_backoff_secs: 0,
        launch_stagger_secs: 0,
        warmup_secs: 0,
        failed_warmup_secs: 0,
        exerciser_settle_secs: 0,
        health_interval_secs: 0,
        flush_grace_secs: 0,
        retry_pause_secs: 0,
        port_probe_timeout_ms: 100,
        seed: Some(42),
        ..GymConfig::default()
    }
}

/// What happens to a container once its scripted poll comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    /// Reports `exited` from then on.
    Exit,
    /// Reports `removing` once, then is gone.
    Removing,
    /// Is gone before the poll, so the status call itself fails.
    Vanish,
}

struct FakeContainer {
    image: String,
    polls: u32,
    fate: Option<(u32, Fate)>,
    exited: bool,
}

struct ExitRule {
    poll: u32,
    fate: Fate,
    remaining: Option<u32>,
}

#[derive(Default)]
struct FakeState {
    images: BTreeSet<String>,
    fail_start: BTreeSet<String>,
    fail_stop: BTreeSet<String>,
    exit_rules: BTreeMap<String, ExitRule>,
    errors_watch: Option<PathBuf>,
    errors_seen_at_stop: Vec<bool>,
    containers: BTreeMap<String, FakeContainer>,
    env_log: BTreeMap<String, BTreeMap<String, String>>,
    events: Vec<String>,
}

/// In-memory container engine. Containers behave as if started with
/// `--rm`: a stopped container disappears.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub(crate) fn with_images(images: &[&str]) -> Self {
        let runtime = Self::default();
        runtime
            .lock()
            .images
            .extend(images.iter().map(|s| s.to_string()));
        runtime
    }

    pub(crate) fn fail_start(self, image: &str) -> Self {
        self.lock().fail_start.insert(image.to_string());
        self
    }

    pub(crate) fn fail_stop(self, image: &str) -> Self {
        self.lock().fail_stop.insert(image.to_string());
        self
    }

    /// Containers of `image` report `exited` from their `poll`-th status
    /// check on. `times` limits how many containers are affected.
    pub(crate) fn exit_at_poll(self, image: &str, poll: u32, times: Option<u32>) -> Self {
        self.with_fate(image, poll, times, Fate::Exit)
    }

    /// Containers of `image` report `removing` at their `poll`-th status
    /// check, as an auto-removed container does right after its process
    /// exits, and are gone afterwards.
    pub(crate) fn removing_at_poll(self, image: &str, poll: u32) -> Self {
        self.with_fate(image, poll, None, Fate::Removing)
    }

    /// Containers of `image` disappear just before their `poll`-th status
    /// check, which then fails with "No such container".
    pub(crate) fn vanish_at_poll(self, image: &str, poll: u32) -> Self {
        self.with_fate(image, poll, None, Fate::Vanish)
    }

    fn with_fate(self, image: &str, poll: u32, times: Option<u32>, fate: Fate) -> Self {
        self.lock().exit_rules.insert(
            image.to_string(),
            ExitRule {
                poll,
                fate,
                remaining: times,
            },
        );
        self
    }

    /// On every stop, remember whether any `errors.txt` existed under `root`.
    pub(crate) fn watch_errors_under(self, root: &Path) -> Self {
        self.lock().errors_watch = Some(root.to_path_buf());
        self
    }

    pub(crate) fn errors_seen_at_stop(&self) -> Vec<bool> {
        self.lock().errors_seen_at_stop.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub(crate) fn env_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock().env_log.get(name).cloned()
    }

    /// Names of containers that exist and have not exited.
    pub(crate) fn running(&self) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, c)| !c.exited)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.lock().images.contains(image))
    }

    fn run_detached(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.lock();
        if state.fail_start.contains(&spec.image) {
            return Err(anyhow!("simulated start failure for {}", spec.image));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(anyhow!("container name {} already in use", spec.name));
        }
        let fate = state
            .exit_rules
            .get_mut(&spec.image)
            .and_then(|rule| match rule.remaining {
                Some(0) => None,
                Some(n) => {
                    rule.remaining = Some(n - 1);
                    Some((rule.poll, rule.fate))
                }
                None => Some((rule.poll, rule.fate)),
            });
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                image: spec.image.clone(),
                polls: 0,
                fate,
                exited: false,
            },
        );
        state.env_log.insert(spec.name.clone(), spec.env.clone());
        state.events.push(format!("start:{}", spec.name));
        Ok(())
    }

    fn status(&self, name: &str) -> Result<ContainerStatus> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| anyhow!("No such container: {}", name))?;
        container.polls += 1;
        let polls = container.polls;
        let due = container
            .fate
            .and_then(|(at, fate)| (polls >= at).then_some(fate));
        match due {
            Some(Fate::Vanish) => {
                state.containers.remove(name);
                Err(anyhow!("No such container: {}", name))
            }
            Some(Fate::Removing) => {
                state.containers.remove(name);
                Ok(ContainerStatus::Other("removing".to_string()))
            }
            Some(Fate::Exit) => {
                container.exited = true;
                Ok(ContainerStatus::Exited)
            }
            None if container.exited => Ok(ContainerStatus::Exited),
            None => Ok(ContainerStatus::Running),
        }
    }

    fn stop(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.events.push(format!("stop:{}", name));
        if let Some(root) = state.errors_watch.clone() {
            let seen = WalkDir::new(root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_name() == ERRORS_FILE);
            state.errors_seen_at_stop.push(seen);
        }
        let container = state
            .containers
            .remove(name)
            .ok_or_else(|| anyhow!("No such container: {}", name))?;
        if state.fail_stop.contains(&container.image) {
            return Err(anyhow!("simulated stop failure for {}", container.image));
        }
        Ok(())
    }
}

/// Shared count of samples a probe has handed out.
#[derive(Clone, Default)]
pub(crate) struct SampleCounter(Arc<AtomicUsize>);

impl SampleCounter {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Replays a fixed script of snapshots, then repeats `fallback` forever.
pub(crate) struct ScriptedProbe {
    script: VecDeque<ResourceSnapshot>,
    fallback: ResourceSnapshot,
    taken: SampleCounter,
}

impl ScriptedProbe {
    pub(crate) fn new(script: Vec<ResourceSnapshot>, fallback: ResourceSnapshot) -> Self {
        Self {
            script: script.into(),
            fallback,
            taken: SampleCounter::default(),
        }
    }

    pub(crate) fn taken(&self) -> SampleCounter {
        self.taken.clone()
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&mut self) -> ResourceSnapshot {
        self.taken.0.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or(self.fallback)
    }
}
