//! Session debug log: a single append-only file of timestamped,
//! categorized records, truncated at the start of each scheduler session.
//!
//! This is a diagnostic artifact, not a correctness feature: write errors
//! are reported through `tracing` and otherwise swallowed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use drover_catalog::Feature;

/// File name of the debug log inside the project state directory.
pub const DEBUG_LOG_FILE: &str = "orchestrator_debug.log";

/// Thread-safe debug logger writing to a single file.
#[derive(Debug)]
pub struct DebugLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DebugLog {
    /// Logger writing to `orchestrator_debug.log` under the project's
    /// state directory.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(
            project_dir
                .join(drover_catalog::CatalogConfig::STATE_DIR)
                .join(DEBUG_LOG_FILE),
        )
    }

    /// Logger writing to an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the start of a new session. Truncates the previous log.
    pub fn start_session(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .and_then(|mut f| {
                writeln!(
                    f,
                    "=== Orchestrator Debug Log Started: {} ===",
                    Local::now().to_rfc3339()
                )?;
                writeln!(f, "=== PID: {} ===\n", std::process::id())
            });
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to start debug log session");
        }
    }

    /// Append a timestamped record with optional key/value detail lines.
    pub fn log(&self, category: &str, message: &str, kv: &[(&str, String)]) {
        let timestamp = Local::now().format("%H:%M:%S%.3f");
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                writeln!(f, "[{timestamp}] [{category}] {message}")?;
                for (key, value) in kv {
                    writeln!(f, "    {key}: {value}")?;
                }
                writeln!(f)
            });
        if let Err(e) = result {
            tracing::debug!(path = %self.path.display(), error = %e, "debug log write failed");
        }
    }

    /// Append a section banner.
    pub fn section(&self, title: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let banner = "=".repeat(60);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "\n{banner}\n  {title}\n{banner}\n"));
        if let Err(e) = result {
            tracing::debug!(path = %self.path.display(), error = %e, "debug log write failed");
        }
    }

    /// Record a summary of catalog state: passing / in-progress / pending
    /// id sets (pending truncated to the first 10).
    pub fn log_catalog_state(&self, label: &str, features: &[Feature]) {
        let passing: Vec<i64> = features.iter().filter(|f| f.passes).map(|f| f.id).collect();
        let in_progress: Vec<i64> = features
            .iter()
            .filter(|f| f.in_progress && !f.passes)
            .map(|f| f.id)
            .collect();
        let pending: Vec<i64> = features
            .iter()
            .filter(|f| !f.passes && !f.in_progress)
            .map(|f| f.id)
            .collect();

        self.log(
            "CATALOG",
            &format!("catalog state {label}"),
            &[
                ("total_features", features.len().to_string()),
                ("passing_count", passing.len().to_string()),
                ("passing_ids", format!("{passing:?}")),
                ("in_progress_count", in_progress.len().to_string()),
                ("in_progress_ids", format!("{in_progress:?}")),
                ("pending_count", pending.len().to_string()),
                (
                    "pending_ids",
                    format!("{:?}", &pending[..pending.len().min(10)]),
                ),
            ],
        );
    }
}
