use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::artifacts::is_completed;
use crate::runtime::ContainerRuntime;

/// One (target, exerciser) combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pairing {
    pub target: String,
    pub exerciser: String,
}

impl Pairing {
    pub fn new(target: impl Into<String>, exerciser: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            exerciser: exerciser.into(),
        }
    }

    pub fn results_dir(&self, results_root: &Path) -> PathBuf {
        results_root.join(&self.target).join(&self.exerciser)
    }
}

impl fmt::Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.exerciser, self.target)
    }
}

/// A planned repetition of a pairing; `replication` is its 1-based position
/// within the desired count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkItem {
    pub pairing: Pairing,
    pub replication: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPlan {
    pub pairing: Pairing,
    pub existing: u32,
    pub needed: u32,
}

/// Counts run directories under a pairing that carry a `completed` marker.
/// An absent or unreadable directory counts as zero.
pub fn count_completed_runs(pairing_dir: &Path) -> u32 {
    WalkDir::new(pairing_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && is_completed(entry.path()))
        .count() as u32
}

pub fn survey(results_root: &Path, pairings: &[Pairing], desired: u32) -> Vec<PairingPlan> {
    pairings
        .iter()
        .map(|pairing| {
            let existing = count_completed_runs(&pairing.results_dir(results_root));
            PairingPlan {
                pairing: pairing.clone(),
                existing,
                needed: desired.saturating_sub(existing),
            }
        })
        .collect()
}

pub fn plan_runs(results_root: &Path, pairings: &[Pairing], desired: u32) -> Vec<RunWorkItem> {
    survey(results_root, pairings, desired)
        .into_iter()
        .flat_map(|plan| {
            let first = plan.existing + 1;
            (first..first + plan.needed).map(move |replication| RunWorkItem {
                pairing: plan.pairing.clone(),
                replication,
            })
        })
        .collect()
}

/// Images referenced by the plan that the runtime does not have. A runtime
/// error while checking counts as missing.
pub fn missing_images(
    runtime: &dyn ContainerRuntime,
    image_prefix: &str,
    items: &[RunWorkItem],
) -> BTreeSet<String> {
    let ids: BTreeSet<&str> = items
        .iter()
        .flat_map(|item| [item.pairing.target.as_str(), item.pairing.exerciser.as_str()])
        .collect();
    let mut missing = BTreeSet::new();
    for id in ids {
        let image = format!("{}{}", image_prefix, id);
        match runtime.image_exists(&image) {
            Ok(true) => {}
            Ok(false) => {
                missing.insert(id.to_string());
            }
            Err(err) => {
                warn!(image = %image, error = %err, "image check failed, treating as missing");
                missing.insert(id.to_string());
            }
        }
    }
    missing
}

pub fn filter_missing_images(
    items: Vec<RunWorkItem>,
    missing: &BTreeSet<String>,
) -> Vec<RunWorkItem> {
    items
        .into_iter()
        .filter(|item| {
            !missing.contains(&item.pairing.target) && !missing.contains(&item.pairing.exerciser)
        })
        .collect()
}
