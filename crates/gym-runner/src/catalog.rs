use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::planner::Pairing;

pub const TARGETS_DIR: &str = "apis";
pub const EXERCISERS_DIR: &str = "tools";
pub const TARGET_CONFIG_FILE: &str = "restgym-api-config.yml";
pub const EXERCISER_CONFIG_FILE: &str = "restgym-tool-config.yml";

#[derive(Debug, Deserialize)]
struct EntryConfig {
    enabled: bool,
}

pub fn discover_targets(root: &Path) -> Result<Vec<String>> {
    discover(&root.join(TARGETS_DIR), TARGET_CONFIG_FILE)
}

pub fn discover_exercisers(root: &Path) -> Result<Vec<String>> {
    discover(&root.join(EXERCISERS_DIR), EXERCISER_CONFIG_FILE)
}

/// Every enabled target paired with every enabled exerciser, sorted.
pub fn enumerate_pairings(root: &Path) -> Result<Vec<Pairing>> {
    let targets = discover_targets(root)?;
    let exercisers = discover_exercisers(root)?;
    let mut pairings = Vec::with_capacity(targets.len() * exercisers.len());
    for target in &targets {
        for exerciser in &exercisers {
            pairings.push(Pairing::new(target.clone(), exerciser.clone()));
        }
    }
    pairings.sort();
    Ok(pairings)
}

fn discover(dir: &Path, config_name: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        // Hidden entries and `#...-template` scaffolding are never runnable.
        if name.starts_with('.') || name.starts_with('#') {
            continue;
        }
        if is_enabled(&entry.path().join(config_name)) {
            ids.push(name);
        }
    }
    ids.sort();
    Ok(ids)
}

fn is_enabled(config_path: &Path) -> bool {
    if !config_path.exists() {
        return true;
    }
    let raw = match fs::read_to_string(config_path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %config_path.display(), error = %err, "unreadable config, skipping entry");
            return false;
        }
    };
    match serde_yaml::from_str::<EntryConfig>(&raw) {
        Ok(config) => config.enabled,
        Err(err) => {
            warn!(path = %config_path.display(), error = %err, "invalid config, skipping entry");
            false
        }
    }
}
