//! Argv construction for the worker binary's three roles.
//!
//! The worker is an external collaborator: the core only spawns it with
//! the agreed flags and reads its merged output stream.

use std::path::{Path, PathBuf};

/// Which role a spawned worker plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Implements one feature.
    Coding { feature_id: i64 },
    /// Re-verifies one already-passing feature.
    Testing { feature_id: i64 },
    /// Seeds an empty catalog.
    Initializer,
}

impl AgentKind {
    /// Value for the `--agent-type` flag.
    pub fn agent_type(&self) -> &'static str {
        match self {
            Self::Coding { .. } => "coding",
            Self::Testing { .. } => "testing",
            Self::Initializer => "initializer",
        }
    }

    /// Feature id this agent is attached to. Initializer output is
    /// reported under feature id 0.
    pub fn feature_id(&self) -> i64 {
        match self {
            Self::Coding { feature_id } | Self::Testing { feature_id } => *feature_id,
            Self::Initializer => 0,
        }
    }
}

/// Everything needed to spawn one worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    /// Path to the worker binary.
    pub worker: PathBuf,
    /// Target project the worker operates on.
    pub project_dir: PathBuf,
    /// Model identifier forwarded to the worker, if any.
    pub model: Option<String>,
    /// Skip-regression-testing mode (coding agents only).
    pub yolo: bool,
    pub kind: AgentKind,
}

impl WorkerInvocation {
    /// Working directory for the child: the worker's install root, not
    /// the target project (the project is passed via `--project-dir`).
    /// A bare binary name resolved via `$PATH` has no directory
    /// component and runs from the current directory.
    pub fn install_root(&self) -> &Path {
        match self.worker.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Build the full argument vector (excluding argv\[0\]).
    pub fn argv(&self) -> Vec<String> {
        let mut args = vec![
            "--project-dir".to_string(),
            self.project_dir.display().to_string(),
            "--max-iterations".to_string(),
            "1".to_string(),
            "--agent-type".to_string(),
            self.kind.agent_type().to_string(),
        ];

        match self.kind {
            AgentKind::Coding { feature_id } => {
                args.push("--feature-id".to_string());
                args.push(feature_id.to_string());
            }
            AgentKind::Testing { feature_id } => {
                args.push("--testing-feature-id".to_string());
                args.push(feature_id.to_string());
            }
            AgentKind::Initializer => {}
        }

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if self.yolo && matches!(self.kind, AgentKind::Coding { .. }) {
            args.push("--yolo".to_string());
        }

        args
    }
}
