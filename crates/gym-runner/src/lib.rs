pub mod artifacts;
pub mod attempt;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod planner;
pub mod ports;
pub mod progress;
pub mod resources;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use attempt::{AttemptState, RunAttempt};
pub use catalog::enumerate_pairings;
pub use config::{parse_desired_runs, resolve_root, GymConfig};
pub use error::{AttemptError, Role};
pub use executor::{AttemptReport, RunExecutor, WorkItemReport};
pub use planner::{
    filter_missing_images, missing_images, plan_runs, survey, Pairing, PairingPlan, RunWorkItem,
};
pub use ports::PortAllocator;
pub use resources::{ResourceFloors, ResourceGate, ResourceProbe, ResourceSnapshot, SystemProbe};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, DockerCli};
pub use scheduler::{ScheduleReport, Scheduler};
