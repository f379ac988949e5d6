use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::config::GymConfig;
use crate::executor::{RunExecutor, WorkItemReport};
use crate::planner::RunWorkItem;
use crate::progress::{notify, Notice, Position};
use crate::resources::ResourceGate;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub items: Vec<WorkItemReport>,
    /// Dispatched items whose task could not be spawned or panicked.
    pub lost: Vec<RunWorkItem>,
}

impl ScheduleReport {
    pub fn completed(&self) -> usize {
        self.items.iter().filter(|r| r.completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.completed() + self.lost.len()
    }

    pub fn attempts(&self) -> usize {
        self.items.iter().map(|r| r.attempts.len()).sum()
    }
}

/// Single control loop: admission and dispatch happen one at a time here,
/// while every admitted item runs on its own thread.
pub struct Scheduler {
    executor: Arc<RunExecutor>,
    config: Arc<GymConfig>,
    gate: ResourceGate,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: GymConfig,
        results_root: PathBuf,
        gate: ResourceGate,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let config = Arc::new(config);
        let executor = Arc::new(RunExecutor::new(runtime, Arc::clone(&config), results_root));
        Self {
            executor,
            config,
            gate,
            rng,
        }
    }

    /// Runs every item to completion or exhaustion of its attempts. Returns
    /// once all dispatched threads have finished.
    pub fn run(&mut self, items: Vec<RunWorkItem>) -> ScheduleReport {
        let total = items.len();
        let mut pending = items;
        let mut handles: Vec<(RunWorkItem, JoinHandle<WorkItemReport>)> = Vec::new();
        let mut report = ScheduleReport::default();
        let mut index = 0;

        while !pending.is_empty() {
            index += 1;
            // Random pick spreads repeated pairings out over time.
            let pick = self.rng.gen_range(0..pending.len());
            let item = pending.swap_remove(pick);
            let position = Position { index, total };

            self.wait_for_admission(position);

            let executor = Arc::clone(&self.executor);
            let task_item = item.clone();
            let spawned = thread::Builder::new()
                .name(format!("run-{}", index))
                .spawn(move || executor.execute(&task_item, position));
            match spawned {
                Ok(handle) => {
                    info!(pairing = %item.pairing, index, total, "run dispatched");
                    handles.push((item, handle));
                }
                Err(err) => {
                    error!(pairing = %item.pairing, error = %err, "could not spawn run thread");
                    report.lost.push(item);
                }
            }

            if !pending.is_empty() {
                thread::sleep(self.config.launch_stagger());
            }
        }

        for (item, handle) in handles {
            match handle.join() {
                Ok(item_report) => report.items.push(item_report),
                Err(_) => {
                    error!(pairing = %item.pairing, "run thread panicked");
                    report.lost.push(item);
                }
            }
        }
        report
    }

    fn wait_for_admission(&mut self, position: Position) {
        let mut notified = false;
        while !self.gate.admit() {
            if !notified {
                notify(
                    Notice::Wait,
                    position,
                    "Waiting for system resources to be released.",
                );
                notified = true;
            }
            thread::sleep(self.config.gate_backoff());
        }
    }
}
