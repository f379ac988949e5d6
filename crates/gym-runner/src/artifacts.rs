//! On-disk record of each run attempt.
//!
//! Layout under the results root:
//!
//! ```text
//! <target>/<exerciser>/run-<timestamp>/
//!     started.txt      appended at provisioning
//!     errors.txt       appended once per failure cause
//!     completed.txt    created exactly once, on success
//!     results.db       written by the capture addon inside the target
//!     code-coverage/   written by the target's instrumentation
//! ```

use anyhow::Result;
use chrono::{Local, Utc};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::AttemptError;

pub const STARTED_MARKER: &str = "started.txt";
pub const COMPLETED_MARKER: &str = "completed.txt";
pub const ERRORS_FILE: &str = "errors.txt";
pub const ATTEMPT_STATE_FILE: &str = "attempt_state.json";

const MAX_RUN_ID_SUFFIX: u32 = 1000;

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Creates a fresh run directory named after `base_id`. When two attempts
/// of the same pairing start within the same second the later one gets a
/// `-2`, `-3`, ... suffix; an existing directory is never reused.
pub fn create_run_dir(pairing_dir: &Path, base_id: &str) -> io::Result<(String, PathBuf)> {
    ensure_dir(pairing_dir)?;
    for n in 1..=MAX_RUN_ID_SUFFIX {
        let run_id = if n == 1 {
            base_id.to_string()
        } else {
            format!("{}-{}", base_id, n)
        };
        let run_dir = pairing_dir.join(&run_id);
        match create_exclusive_dir(&run_dir) {
            Ok(()) => return Ok((run_id, run_dir)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!(
            "every run id derived from {} under {} is taken",
            base_id,
            pairing_dir.display()
        ),
    ))
}

fn create_exclusive_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    // Containers write into the run directory as a different user.
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }
    builder.create(path)
}

fn append_text(path: &Path, text: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()
}

fn timestamp() -> String {
    Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

pub fn write_started(run_dir: &Path) -> io::Result<()> {
    append_text(
        &run_dir.join(STARTED_MARKER),
        &format!("Run started on {}.\n", timestamp()),
    )
}

pub fn record_error(run_dir: &Path, err: &AttemptError) -> io::Result<()> {
    append_text(&run_dir.join(ERRORS_FILE), &format!("{}\n\n", err))
}

/// Terminal success marker. Creation is exclusive: a second call on the
/// same directory fails with `AlreadyExists` instead of appending.
pub fn write_completed(run_dir: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(run_dir.join(COMPLETED_MARKER))?;
    file.write_all(format!("Run completed on {}.\n", timestamp()).as_bytes())?;
    file.sync_all()
}

pub fn is_completed(run_dir: &Path) -> bool {
    run_dir.join(COMPLETED_MARKER).is_file()
}

/// Writes through a staging file beside `path`, renames it into place and
/// syncs the directory so the rename itself is durable.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(dir)?;
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state");
    let staging = dir.join(format!(
        ".{}.{}.{}",
        file_name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    {
        let mut file = fs::File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&staging, path)?;
    sync_dir(dir);
    Ok(())
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)?;
    Ok(())
}
