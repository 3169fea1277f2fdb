//! Dependency-aware scheduler loop: selects ready features, supervises
//! bounded pools of coding and testing agents, accounts for retries, and
//! recovers features interrupted by a previous session.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use drover_catalog::{Catalog, ClaimOutcome, Feature, ResumeOutcome};

use crate::debuglog::DebugLog;
use crate::pools::{AdmissionError, AgentPools};
use crate::resolver;
use crate::supervisor::{KILL_TREE_TIMEOUT, kill_process_tree, spawn_worker};
use crate::worker::{AgentKind, WorkerInvocation};

pub use crate::pools::{MAX_PARALLEL_AGENTS, MAX_TOTAL_AGENTS};

/// Coding attempts per feature before it is terminally skipped for the
/// session.
pub const MAX_FEATURE_RETRIES: u32 = 3;

/// Upper bound on the testing pool size.
pub const TESTING_RATIO_MAX: usize = 3;

/// How long the loop sleeps when it has nothing to admit.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Settling pause after admitting a batch of agents.
const POST_SPAWN_PAUSE: Duration = Duration::from_secs(2);

/// Hard deadline for the one-shot initializer worker.
pub const INITIALIZER_TIMEOUT: Duration = Duration::from_secs(1800);

/// Feature id under which initializer output is reported.
pub const INITIALIZER_FEATURE_ID: i64 = 0;

/// Orchestrator configuration. Concurrency knobs are clamped to their
/// hard caps at construction.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Target project the workers operate on.
    pub project_dir: PathBuf,
    /// Path to the worker binary.
    pub worker: PathBuf,
    /// Maximum concurrent coding agents (1..=5).
    pub max_concurrency: usize,
    /// Testing pool size (0..=3). 0 disables regression testing.
    pub testing_agent_ratio: usize,
    /// Model identifier forwarded to workers.
    pub model: Option<String>,
    /// Skip regression testing entirely.
    pub yolo: bool,
}

/// Status values reported through the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-line worker output: `(feature_id, line)`. Feature id 0 is the
/// initializer.
pub type OutputFn = Arc<dyn Fn(i64, &str) + Send + Sync>;

/// Status transitions: `(feature_id, status)`.
pub type StatusFn = Arc<dyn Fn(i64, AgentStatus) + Send + Sync>;

/// Why a feature could not be started.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("feature {id} rejected by catalog: {outcome}")]
    ClaimRefused { id: i64, outcome: ClaimOutcome },
    #[error("feature {id} is not resumable: {outcome}")]
    NotResumable { id: i64, outcome: ResumeOutcome },
    #[error("failed to spawn worker for feature {id}: {inner:#}")]
    Spawn { id: i64, inner: anyhow::Error },
    #[error("catalog error: {0:#}")]
    Catalog(anyhow::Error),
}

/// Point-in-time view of the orchestrator for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub running_features: Vec<i64>,
    pub coding_agent_count: usize,
    pub testing_agent_count: usize,
    pub max_concurrency: usize,
    pub testing_agent_ratio: usize,
    pub is_running: bool,
    pub yolo_mode: bool,
}

enum Tick {
    Continue,
    Finished,
}

struct Inner {
    config: OrchestratorConfig,
    catalog: Catalog,
    pools: AgentPools,
    retries: Mutex<HashMap<i64, u32>>,
    /// Coalescing wakeup: set by completion handlers, consumed only by
    /// the scheduler loop.
    completion: Notify,
    cancel: CancellationToken,
    debug_log: DebugLog,
    on_output: OutputFn,
    on_status: StatusFn,
    running: AtomicBool,
}

/// The scheduler. A cheap clonable handle: completion handlers running
/// on reader tasks share the pools, the retry table, and the completion
/// signal with the loop.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator. `max_concurrency` is clamped to
    /// `1..=MAX_PARALLEL_AGENTS` and `testing_agent_ratio` to
    /// `0..=TESTING_RATIO_MAX`.
    pub fn new(mut config: OrchestratorConfig, on_output: OutputFn, on_status: StatusFn) -> Self {
        config.max_concurrency = config.max_concurrency.clamp(1, MAX_PARALLEL_AGENTS);
        config.testing_agent_ratio = config.testing_agent_ratio.min(TESTING_RATIO_MAX);

        let catalog = Catalog::for_project(&config.project_dir);
        let debug_log = DebugLog::for_project(&config.project_dir);

        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                pools: AgentPools::new(),
                retries: Mutex::new(HashMap::new()),
                completion: Notify::new(),
                cancel: CancellationToken::new(),
                debug_log,
                on_output,
                on_status,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The catalog this orchestrator schedules over.
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Request a graceful shutdown: the loop stops admitting, stops all
    /// agents, and drains.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.completion.notify_one();
    }

    /// Status snapshot.
    pub fn status(&self) -> OrchestratorStatus {
        let inner = &self.inner;
        let (coding, testing) = inner.pools.counts();
        OrchestratorStatus {
            running_features: inner.pools.coding_ids(),
            coding_agent_count: coding,
            testing_agent_count: testing,
            max_concurrency: inner.config.max_concurrency,
            testing_agent_ratio: inner.config.testing_agent_ratio,
            is_running: inner.running.load(Ordering::SeqCst),
            yolo_mode: inner.config.yolo,
        }
    }

    /// Run the session to completion (or until [`Self::shutdown`]).
    ///
    /// Seeds the catalog through the initializer worker when it is
    /// empty, then drives the scheduling loop, then drains both pools.
    pub async fn run(&self) -> Result<()> {
        self.inner.running.store(true, Ordering::SeqCst);
        let result = self.run_loop().await;
        self.inner.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_loop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.debug_log.start_session();
        inner
            .catalog
            .ensure_schema()
            .await
            .context("failed to prepare catalog")?;

        if !inner.catalog.has_any_features().await? {
            self.run_initializer().await?;
        }

        let snapshot = inner.catalog.snapshot().await?;
        inner.debug_log.log_catalog_state("at session start", &snapshot);
        inner.debug_log.section("MAIN LOOP");

        loop {
            if inner.cancel.is_cancelled() {
                tracing::info!("shutdown requested, leaving scheduler loop");
                break;
            }
            match self.tick().await {
                Ok(Tick::Finished) => break,
                Ok(Tick::Continue) => {}
                Err(e) => {
                    // One bad iteration must not kill the session or
                    // hot-spin it.
                    tracing::error!(error = %format!("{e:#}"), "scheduler iteration failed");
                    inner.debug_log.log(
                        "ERROR",
                        "scheduler iteration failed",
                        &[("error", format!("{e:#}"))],
                    );
                    self.wait_for_completion(POLL_INTERVAL).await;
                }
            }
        }

        if inner.cancel.is_cancelled() {
            self.stop_all().await;
        }

        // Drain: completion handlers empty the pools as children reap.
        loop {
            let (coding, testing) = inner.pools.counts();
            if coding == 0 && testing == 0 {
                break;
            }
            self.wait_for_completion(Duration::from_secs(1)).await;
        }

        inner.debug_log.log("LOOP", "session finished", &[]);
        Ok(())
    }

    /// One scheduler iteration.
    async fn tick(&self) -> Result<Tick> {
        let inner = &self.inner;

        if self.all_complete().await? {
            tracing::info!("all features complete");
            inner.debug_log.log("LOOP", "all features complete", &[]);
            return Ok(Tick::Finished);
        }

        self.maintain_testing_pool().await?;

        let (coding, _) = inner.pools.counts();
        if coding >= inner.config.max_concurrency {
            self.wait_for_completion(POLL_INTERVAL).await;
            return Ok(Tick::Continue);
        }
        let open_slots = inner.config.max_concurrency - coding;

        let snapshot = inner.catalog.snapshot().await?;
        let retries = self.retry_counts();
        let coding_ids = inner.pools.coding_ids();

        // Features left in-progress by an interrupted session come first.
        let resumable = resumable_features(&snapshot, &retries, &coding_ids);
        if !resumable.is_empty() {
            let ids: Vec<i64> = resumable.iter().map(|f| f.id).collect();
            tracing::info!(features = ?ids, "resuming interrupted features");
            inner.debug_log.log(
                "RESUME",
                "resuming interrupted features",
                &[("candidates", format!("{ids:?}"))],
            );
            for feature in resumable.into_iter().take(open_slots) {
                match self.start_feature(feature.id, true).await {
                    Ok(()) => {
                        tracing::info!(feature_id = feature.id, name = %feature.name, "resumed feature");
                    }
                    Err(e) => {
                        tracing::warn!(feature_id = feature.id, error = %e, "failed to resume feature");
                        inner.debug_log.log(
                            "RESUME",
                            "resume failed",
                            &[
                                ("feature_id", feature.id.to_string()),
                                ("error", e.to_string()),
                            ],
                        );
                    }
                }
            }
            tokio::time::sleep(POST_SPAWN_PAUSE).await;
            return Ok(Tick::Continue);
        }

        let ready = ready_features(&snapshot, &retries, &coding_ids);
        if ready.is_empty() {
            if coding > 0 {
                self.wait_for_completion(POLL_INTERVAL).await;
            } else {
                // Nothing running, nothing ready: either we just finished
                // or every remaining feature is dependency-blocked.
                if self.all_complete().await? {
                    return Ok(Tick::Finished);
                }
                tracing::warn!("all remaining features are blocked by dependencies");
                inner.debug_log.log(
                    "LOOP",
                    "all remaining features blocked by dependencies",
                    &[],
                );
                self.wait_for_completion(2 * POLL_INTERVAL).await;
            }
            return Ok(Tick::Continue);
        }

        for feature in ready.into_iter().take(open_slots) {
            match self.start_feature(feature.id, false).await {
                Ok(()) => {
                    tracing::info!(feature_id = feature.id, name = %feature.name, "started feature");
                }
                Err(e) => {
                    tracing::warn!(feature_id = feature.id, error = %e, "failed to start feature");
                    inner.debug_log.log(
                        "SCHEDULE",
                        "start failed",
                        &[
                            ("feature_id", feature.id.to_string()),
                            ("error", e.to_string()),
                        ],
                    );
                }
            }
        }
        tokio::time::sleep(POST_SPAWN_PAUSE).await;
        Ok(Tick::Continue)
    }

    /// Start a coding agent for a feature.
    ///
    /// Admission is checked and the slot reserved atomically; the
    /// catalog claim and the spawn happen outside the pool lock, with
    /// the reservation rolled back on any failure.
    pub async fn start_feature(&self, id: i64, resume: bool) -> Result<(), StartError> {
        let inner = &self.inner;
        let _abort = inner
            .pools
            .reserve_coding(id, inner.config.max_concurrency)?;

        if resume {
            match inner.catalog.verify_resumable(id).await {
                Ok(ResumeOutcome::Resumable) => {}
                Ok(outcome) => {
                    inner.pools.cancel_coding(id);
                    return Err(StartError::NotResumable { id, outcome });
                }
                Err(e) => {
                    inner.pools.cancel_coding(id);
                    return Err(StartError::Catalog(e));
                }
            }
        } else {
            match inner.catalog.claim_for_coding(id).await {
                Ok(ClaimOutcome::Claimed) => {}
                Ok(outcome) => {
                    inner.pools.cancel_coding(id);
                    return Err(StartError::ClaimRefused { id, outcome });
                }
                Err(e) => {
                    inner.pools.cancel_coding(id);
                    return Err(StartError::Catalog(e));
                }
            }
        }

        let invocation = self.worker_invocation(AgentKind::Coding { feature_id: id });
        let on_output = Arc::clone(&inner.on_output);
        let process = match spawn_worker(&invocation, move |line: &str| on_output(id, line)) {
            Ok(p) => p,
            Err(e) => {
                // The spawn failure is not the feature's fault: release
                // the claim so it stays schedulable, no retry charged.
                inner.pools.cancel_coding(id);
                if let Err(release_err) = inner.catalog.release_in_progress(id).await {
                    tracing::warn!(feature_id = id, error = %release_err, "failed to release claim after spawn failure");
                }
                return Err(StartError::Spawn { id, inner: e });
            }
        };

        let pid = process.pid;
        inner.pools.commit_coding(id, pid);
        (inner.on_status)(id, AgentStatus::Running);
        inner.debug_log.log(
            "SPAWN",
            "coding agent started",
            &[
                ("feature_id", id.to_string()),
                ("pid", pid.to_string()),
                ("resume", resume.to_string()),
            ],
        );

        let this = self.clone();
        tokio::spawn(async move {
            let code = process.wait().await;
            this.handle_coding_exit(id, code).await;
        });

        Ok(())
    }

    /// Stop one coding agent: flag the abort signal, then take down its
    /// process tree. Returns false if the feature has no agent.
    pub async fn stop_feature(&self, id: i64) -> bool {
        let Some(slot) = self.inner.pools.coding_slot(id) else {
            return false;
        };
        slot.abort.cancel();
        if slot.pid != 0 {
            let pid = slot.pid;
            let report =
                tokio::task::spawn_blocking(move || kill_process_tree(pid, KILL_TREE_TIMEOUT))
                    .await
                    .unwrap_or_default();
            self.inner.debug_log.log(
                "STOP",
                "stopped coding agent",
                &[
                    ("feature_id", id.to_string()),
                    ("pid", pid.to_string()),
                    ("found", report.found.to_string()),
                    ("killed", report.killed.to_string()),
                ],
            );
        }
        true
    }

    /// Stop every agent: coding agents first, then the testing pool,
    /// which is cleared atomically so no stale completions are reported.
    pub async fn stop_all(&self) {
        for id in self.inner.pools.coding_ids() {
            self.stop_feature(id).await;
        }
        for (pid, slot) in self.inner.pools.drain_testing() {
            let report =
                tokio::task::spawn_blocking(move || kill_process_tree(pid, KILL_TREE_TIMEOUT))
                    .await
                    .unwrap_or_default();
            self.inner.debug_log.log(
                "STOP",
                "stopped testing agent",
                &[
                    ("feature_id", slot.feature_id.to_string()),
                    ("pid", pid.to_string()),
                    ("killed", report.killed.to_string()),
                ],
            );
        }
        self.inner.completion.notify_one();
    }

    /// Top up the testing pool. Idempotent at a fixed point: once the
    /// pool is at its cap (or no target exists) another call does
    /// nothing.
    async fn maintain_testing_pool(&self) -> Result<()> {
        let inner = &self.inner;
        let ratio = inner.config.testing_agent_ratio;
        if inner.config.yolo || ratio == 0 {
            return Ok(());
        }
        if inner.catalog.count_passing().await? == 0 {
            return Ok(());
        }
        if self.all_complete().await? {
            return Ok(());
        }

        loop {
            if !inner
                .pools
                .has_testing_capacity(ratio, inner.config.max_concurrency)
            {
                break;
            }
            let Some(feature_id) = inner.catalog.random_passing_not_in_progress().await? else {
                break;
            };

            let invocation = self.worker_invocation(AgentKind::Testing { feature_id });
            let on_output = Arc::clone(&inner.on_output);
            let process = match spawn_worker(&invocation, move |line: &str| on_output(feature_id, line)) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(feature_id, error = %format!("{e:#}"), "failed to spawn testing agent");
                    break;
                }
            };

            let pid = process.pid;
            if !inner
                .pools
                .insert_testing(pid, feature_id, ratio, inner.config.max_concurrency)
            {
                // Capacity was taken between the check and the insert.
                tracing::debug!(pid, "testing pool filled up during spawn, discarding agent");
                let _ =
                    tokio::task::spawn_blocking(move || kill_process_tree(pid, KILL_TREE_TIMEOUT));
                break;
            }

            inner.debug_log.log(
                "TESTING",
                "testing agent started",
                &[
                    ("feature_id", feature_id.to_string()),
                    ("pid", pid.to_string()),
                ],
            );

            let this = self.clone();
            tokio::spawn(async move {
                let code = process.wait().await;
                this.handle_testing_exit(pid, code).await;
            });
        }

        Ok(())
    }

    /// Completion handler for coding agents. Runs on the reader task.
    async fn handle_coding_exit(&self, id: i64, code: i32) {
        let inner = &self.inner;
        let removed = inner.pools.remove_coding(id);

        // Repair catalog state before anyone can observe the completion:
        // an agent that exited without finishing must not keep the
        // feature claimed.
        match inner.catalog.get_feature(id).await {
            Ok(Some(f)) if f.in_progress && !f.passes => {
                if let Err(e) = inner.catalog.release_in_progress(id).await {
                    tracing::warn!(feature_id = id, error = %e, "failed to clear in-progress flag");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(feature_id = id, error = %e, "failed to re-read feature after exit");
            }
        }

        if code != 0 {
            let count = {
                let mut retries = inner.retries.lock().unwrap_or_else(|e| e.into_inner());
                let count = retries.entry(id).or_insert(0);
                *count += 1;
                *count
            };
            tracing::warn!(
                feature_id = id,
                exit_code = code,
                attempt = count,
                "coding agent failed"
            );
            if count >= MAX_FEATURE_RETRIES {
                tracing::warn!(feature_id = id, "feature failed {count} times, will not retry");
                inner.debug_log.log(
                    "RETRY",
                    "feature exhausted its retries, will not retry",
                    &[
                        ("feature_id", id.to_string()),
                        ("attempts", count.to_string()),
                    ],
                );
            }
            if removed.is_some() {
                (inner.on_status)(id, AgentStatus::Failed);
            }
        } else if removed.is_some() {
            (inner.on_status)(id, AgentStatus::Completed);
        }

        inner.debug_log.log(
            "REAP",
            "coding agent exited",
            &[
                ("feature_id", id.to_string()),
                ("exit_code", code.to_string()),
            ],
        );
        inner.completion.notify_one();
    }

    /// Completion handler for testing agents. Runs on the reader task.
    async fn handle_testing_exit(&self, pid: u32, code: i32) {
        let inner = &self.inner;
        // A shutdown may have drained the slot already; report nothing
        // for agents we no longer track.
        if let Some(slot) = inner.pools.remove_testing(pid) {
            let status = if code == 0 {
                AgentStatus::Completed
            } else {
                AgentStatus::Failed
            };
            (inner.on_status)(slot.feature_id, status);
            inner.debug_log.log(
                "REAP",
                "testing agent exited",
                &[
                    ("feature_id", slot.feature_id.to_string()),
                    ("pid", pid.to_string()),
                    ("exit_code", code.to_string()),
                ],
            );
        }
        inner.completion.notify_one();
    }

    /// Run the one-shot initializer worker synchronously.
    async fn run_initializer(&self) -> Result<()> {
        let inner = &self.inner;
        tracing::info!("catalog is empty, running initializer");
        inner.debug_log.section("INITIALIZATION");

        let invocation = self.worker_invocation(AgentKind::Initializer);
        let on_output = Arc::clone(&inner.on_output);
        let process = spawn_worker(&invocation, move |line: &str| {
            on_output(INITIALIZER_FEATURE_ID, line)
        })
        .context("failed to spawn initializer")?;
        let pid = process.pid;

        let code = match tokio::time::timeout(INITIALIZER_TIMEOUT, process.wait()).await {
            Ok(code) => code,
            Err(_elapsed) => {
                let report =
                    tokio::task::spawn_blocking(move || kill_process_tree(pid, KILL_TREE_TIMEOUT))
                        .await
                        .unwrap_or_default();
                inner.debug_log.log(
                    "INIT",
                    "initializer timed out",
                    &[
                        ("pid", pid.to_string()),
                        ("killed", report.killed.to_string()),
                    ],
                );
                bail!(
                    "initializer timed out after {}s",
                    INITIALIZER_TIMEOUT.as_secs()
                );
            }
        };

        if code != 0 {
            bail!("initializer exited with code {code}");
        }
        // A fresh session per call means this read already sees whatever
        // the initializer committed.
        if !inner.catalog.has_any_features().await? {
            bail!("initializer completed but the catalog is still empty");
        }

        inner.debug_log.log("INIT", "initializer completed", &[]);
        Ok(())
    }

    /// No feature is still worth scheduling: everything either passes or
    /// has exhausted its retries.
    async fn all_complete(&self) -> Result<bool> {
        let snapshot = self.inner.catalog.snapshot().await?;
        let retries = self.retry_counts();
        Ok(!snapshot
            .iter()
            .any(|f| !f.passes && retries.get(&f.id).copied().unwrap_or(0) < MAX_FEATURE_RETRIES))
    }

    /// Block until an agent completes, the timeout elapses, or shutdown
    /// is requested. The completion signal coalesces: many exits during
    /// one wait wake the loop once.
    async fn wait_for_completion(&self, timeout: Duration) {
        let inner = &self.inner;
        tokio::select! {
            _ = tokio::time::timeout(timeout, inner.completion.notified()) => {}
            _ = inner.cancel.cancelled(), if !inner.cancel.is_cancelled() => {}
        }
    }

    fn retry_counts(&self) -> HashMap<i64, u32> {
        self.inner
            .retries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn worker_invocation(&self, kind: AgentKind) -> WorkerInvocation {
        let config = &self.inner.config;
        WorkerInvocation {
            worker: config.worker.clone(),
            project_dir: config.project_dir.clone(),
            model: config.model.clone(),
            yolo: config.yolo,
            kind,
        }
    }
}

/// Features eligible for a fresh coding agent, in scheduling order:
/// pending, unclaimed, below the retry cap, not already in the coding
/// pool, with every dependency passing.
pub fn ready_features(
    all: &[Feature],
    retries: &HashMap<i64, u32>,
    coding_ids: &[i64],
) -> Vec<Feature> {
    let passing = resolver::passing_ids(all);
    let scores = resolver::compute_scheduling_scores(all);

    let mut ready: Vec<&Feature> = all
        .iter()
        .filter(|f| {
            !f.passes
                && !f.in_progress
                && retries.get(&f.id).copied().unwrap_or(0) < MAX_FEATURE_RETRIES
                && !coding_ids.contains(&f.id)
                && resolver::are_dependencies_satisfied(f, &passing)
        })
        .collect();
    resolver::schedule_order(&mut ready, &scores);
    ready.into_iter().cloned().collect()
}

/// Features left claimed by an interrupted session, in scheduling order:
/// in-progress, not passing, below the retry cap, and not owned by this
/// session's coding pool.
pub fn resumable_features(
    all: &[Feature],
    retries: &HashMap<i64, u32>,
    coding_ids: &[i64],
) -> Vec<Feature> {
    let scores = resolver::compute_scheduling_scores(all);

    let mut resumable: Vec<&Feature> = all
        .iter()
        .filter(|f| {
            f.in_progress
                && !f.passes
                && retries.get(&f.id).copied().unwrap_or(0) < MAX_FEATURE_RETRIES
                && !coding_ids.contains(&f.id)
        })
        .collect();
    resolver::schedule_order(&mut resumable, &scores);
    resumable.into_iter().cloned().collect()
}
