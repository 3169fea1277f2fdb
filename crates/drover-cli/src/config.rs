//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Path to the worker binary.
    pub path: Option<String>,
    /// Default model identifier forwarded to workers.
    pub model: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or
/// `~/.config/drover`, regardless of platform conventions.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file, or `None` if it does not exist.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Default worker binary name, looked up on `$PATH` at spawn time.
pub const DEFAULT_WORKER: &str = "drover-worker";

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroverConfig {
    pub worker: PathBuf,
    pub model: Option<String>,
}

impl DroverConfig {
    /// Resolve using the chain: CLI flag > env var > config file >
    /// default.
    pub fn resolve(worker_flag: Option<PathBuf>, model_flag: Option<String>) -> Result<Self> {
        let file = load_config()?;
        let env_worker = std::env::var("DROVER_WORKER").ok().map(PathBuf::from);
        Ok(Self::resolve_with(worker_flag, model_flag, env_worker, file))
    }

    fn resolve_with(
        worker_flag: Option<PathBuf>,
        model_flag: Option<String>,
        env_worker: Option<PathBuf>,
        file: Option<ConfigFile>,
    ) -> Self {
        let file = file.unwrap_or_default();
        let worker = worker_flag
            .or(env_worker)
            .or_else(|| file.worker.path.as_deref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER));
        let model = model_flag.or(file.worker.model);
        Self { worker, model }
    }
}
