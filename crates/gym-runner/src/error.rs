use std::fmt;
use thiserror::Error;

/// Which side of a pairing a container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Exerciser,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Target => "target",
            Role::Exerciser => "exerciser",
        }
    }

    pub fn sibling(self) -> Role {
        match self {
            Role::Target => Role::Exerciser,
            Role::Exerciser => Role::Target,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures scoped to a single run attempt. None of these escape the
/// attempt: they are appended to its `errors.txt` and fed to the retry loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error("could not create result directory {path}: {message}")]
    Provisioning { path: String, message: String },

    #[error("no free TCP port found in {start}..{end} after {attempts} probes")]
    PortAllocationExhausted { start: u16, end: u16, attempts: u32 },

    #[error("container image(s) not found: {}. Have they been built?", .images.join(", "))]
    ImageMissing { images: Vec<String> },

    #[error("could not start {role} container {name}: {message}")]
    ContainerStart {
        role: Role,
        name: String,
        message: String,
    },

    #[error("{role} container not running at interval {interval}, aborting: {message}")]
    HealthCheck {
        role: Role,
        interval: u32,
        message: String,
    },

    #[error("could not stop {role} container {name}, it possibly crashed: {message}")]
    Teardown {
        role: Role,
        name: String,
        message: String,
    },

    #[error("container runtime failed during {operation}: {message}")]
    Runtime { operation: String, message: String },

    #[error("could not write run artifact {path}: {message}")]
    Artifact { path: String, message: String },
}

impl AttemptError {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Provisioning { .. } => "provisioning",
            AttemptError::PortAllocationExhausted { .. } => "port_allocation_exhausted",
            AttemptError::ImageMissing { .. } => "image_missing",
            AttemptError::ContainerStart { .. } => "container_start",
            AttemptError::HealthCheck { .. } => "health_check",
            AttemptError::Teardown { .. } => "teardown",
            AttemptError::Runtime { .. } => "runtime",
            AttemptError::Artifact { .. } => "artifact",
        }
    }
}
