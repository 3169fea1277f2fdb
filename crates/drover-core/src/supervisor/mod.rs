//! Child process supervision: spawn workers detached from the terminal,
//! stream their merged output line by line, reap them, and sweep the
//! process tree afterwards.

pub mod process_tree;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::worker::WorkerInvocation;
pub use process_tree::{KillReport, kill_process_tree};

/// Grace period for tree termination after a child is reaped or stopped.
pub const KILL_TREE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-line output callback. Lines from stdout and stderr arrive
/// interleaved on the same callback.
pub type OnLine = dyn Fn(&str) + Send + Sync;

/// A spawned worker: its OS pid plus a waiter that resolves with the
/// exit code once output is drained, the child reaped, and the process
/// tree swept.
#[derive(Debug)]
pub struct AgentProcess {
    pub pid: u32,
    waiter: JoinHandle<i32>,
}

impl AgentProcess {
    /// Wait for the full completion sequence. Resolves with the exit
    /// code, or -1 when the child was terminated by a signal.
    pub async fn wait(self) -> i32 {
        self.waiter.await.unwrap_or(-1)
    }
}

/// Spawn a worker subprocess.
///
/// - stdin is a null sink so the child never blocks on reads;
/// - stdout and stderr are piped and drained line by line into
///   `on_line` until EOF;
/// - the child gets its own process group (no controlling terminal
///   signals leak through) and `PYTHONUNBUFFERED=1` so lines arrive as
///   they are produced;
/// - after EOF the child is reaped and [`kill_process_tree`] sweeps any
///   descendants it left behind; sweep results are logged, never fatal.
pub fn spawn_worker(
    invocation: &WorkerInvocation,
    on_line: impl Fn(&str) + Send + Sync + 'static,
) -> Result<AgentProcess> {
    let mut cmd = Command::new(&invocation.worker);
    cmd.args(invocation.argv())
        .current_dir(invocation.install_root())
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    cmd.process_group(0);

    // No console window on platforms that would otherwise pop one.
    #[cfg(windows)]
    cmd.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn worker binary at '{}'",
            invocation.worker.display()
        )
    })?;

    let pid = child.id().context("spawned worker has no pid")?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let on_line: Arc<OnLine> = Arc::new(on_line);

    let waiter = tokio::spawn(async move {
        let out_reader = stdout.map(|s| tokio::spawn(drain_lines(s, Arc::clone(&on_line))));
        let err_reader = stderr.map(|s| tokio::spawn(drain_lines(s, Arc::clone(&on_line))));

        if let Some(task) = out_reader {
            let _ = task.await;
        }
        if let Some(task) = err_reader {
            let _ = task.await;
        }

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to reap worker");
                -1
            }
        };

        let report = tokio::task::spawn_blocking(move || {
            kill_process_tree(pid, KILL_TREE_TIMEOUT)
        })
        .await
        .unwrap_or_default();

        if report.found > 0 {
            tracing::debug!(
                pid,
                found = report.found,
                terminated = report.terminated,
                killed = report.killed,
                "swept worker process tree"
            );
        }

        code
    });

    Ok(AgentProcess { pid, waiter })
}

async fn drain_lines<R>(reader: R, on_line: Arc<OnLine>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(&line),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading worker output");
                break;
            }
        }
    }
}
