//! End-to-end scheduler tests with fake worker scripts.
//!
//! The real worker binary commits `passes` transitions to the catalog
//! itself. Tests stand in for that side effect with an "auto-passer"
//! task that marks a feature passing as soon as its coding agent reports
//! `running`, while the fake worker script merely sleeps and exits.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use drover_catalog::Catalog;
use drover_core::orchestrator::{
    AgentStatus, Orchestrator, OrchestratorConfig, StartError,
};
use drover_core::pools::AdmissionError;
use drover_test_utils::{TestProject, write_worker_script};

type Event = (i64, AgentStatus);

struct TestRig {
    project: TestProject,
    _worker_dir: TempDir,
    orchestrator: Orchestrator,
    events: mpsc::UnboundedReceiver<Event>,
}

impl TestRig {
    /// Build an orchestrator over a fresh project with a fake worker.
    async fn new(
        project: TestProject,
        script_body: &str,
        max_concurrency: usize,
        testing_agent_ratio: usize,
    ) -> Self {
        let worker_dir = TempDir::new().expect("failed to create worker dir");
        let worker = write_worker_script(worker_dir.path(), "worker.sh", script_body);

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let on_status = Arc::new(move |id: i64, status: AgentStatus| {
            let _ = status_tx.send((id, status));
        });

        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                project_dir: project.path().to_path_buf(),
                worker,
                max_concurrency,
                testing_agent_ratio,
                model: None,
                yolo: false,
            },
            Arc::new(|_, _: &str| {}),
            on_status,
        );

        Self {
            project,
            _worker_dir: worker_dir,
            orchestrator,
            events: status_rx,
        }
    }

    /// Interpose the auto-passer: every coding agent that reports
    /// `running` has its feature marked passing, standing in for the
    /// catalog commit a real worker performs.
    fn with_auto_passer(mut self) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let catalog: Catalog = self.project.catalog().clone();
        let mut inner = std::mem::replace(&mut self.events, rx);
        tokio::spawn(async move {
            while let Some((id, status)) = inner.recv().await {
                if status == AgentStatus::Running {
                    let _ = catalog.mark_passing(id).await;
                }
                let _ = tx.send((id, status));
            }
        });
        self
    }

    /// Collect every event already emitted, waiting briefly for
    /// stragglers from reader tasks.
    async fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(300), self.events.recv()).await
        {
            out.push(event);
        }
        out
    }

    /// Wait for a specific event, failing the test after `timeout`.
    async fn expect_event(&mut self, wanted: Event, timeout: Duration) -> Vec<Event> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}, saw {seen:?}"))
                .expect("event channel closed");
            seen.push(event);
            if event == wanted {
                return seen;
            }
        }
    }
}

fn position(events: &[Event], wanted: Event) -> usize {
    events
        .iter()
        .position(|e| *e == wanted)
        .unwrap_or_else(|| panic!("missing event {wanted:?} in {events:?}"))
}

// ===========================================================================
// Full pipeline
// ===========================================================================

#[tokio::test]
async fn dependency_pipeline_runs_in_waves() {
    let project = TestProject::new().await;
    let a = project.seed_feature("a", 1, vec![]).await;
    let b = project.seed_feature("b", 1, vec![a.id]).await;
    let c = project.seed_feature("c", 1, vec![a.id]).await;
    let d = project.seed_feature("d", 1, vec![b.id, c.id]).await;

    let mut rig = TestRig::new(project, "sleep 1\nexit 0\n", 2, 0)
        .await
        .with_auto_passer();

    tokio::time::timeout(Duration::from_secs(60), rig.orchestrator.run())
        .await
        .expect("session should finish")
        .expect("session should succeed");

    let events = rig.drain_events().await;

    // The root feature runs alone first; its dependents follow only
    // after it completes; the join point runs last.
    let a_run = position(&events, (a.id, AgentStatus::Running));
    let a_done = position(&events, (a.id, AgentStatus::Completed));
    let b_run = position(&events, (b.id, AgentStatus::Running));
    let c_run = position(&events, (c.id, AgentStatus::Running));
    let d_run = position(&events, (d.id, AgentStatus::Running));
    assert!(a_run < a_done && a_done < b_run && a_done < c_run);
    assert!(d_run > position(&events, (b.id, AgentStatus::Completed)));
    assert!(d_run > position(&events, (c.id, AgentStatus::Completed)));

    // Everything ended up passing with no claims left behind.
    for f in rig.project.catalog().snapshot().await.unwrap() {
        assert!(f.passes, "feature {} should pass", f.id);
        assert!(!f.in_progress);
    }

    let status = rig.orchestrator.status();
    assert_eq!(status.coding_agent_count, 0);
    assert_eq!(status.testing_agent_count, 0);
    assert!(!status.is_running);
}

// ===========================================================================
// Retry accounting
// ===========================================================================

#[tokio::test]
async fn retry_cap_terminally_fails_a_feature() {
    let project = TestProject::new().await;
    let f = project.seed_feature("doomed", 1, vec![]).await;

    let mut rig = TestRig::new(project, "exit 1\n", 1, 0).await;

    tokio::time::timeout(Duration::from_secs(60), rig.orchestrator.run())
        .await
        .expect("session should finish despite failures")
        .expect("a terminally failed feature is not a session error");

    let events = rig.drain_events().await;
    let runs = events
        .iter()
        .filter(|e| **e == (f.id, AgentStatus::Running))
        .count();
    let failures = events
        .iter()
        .filter(|e| **e == (f.id, AgentStatus::Failed))
        .count();
    assert_eq!(runs, 3, "exactly three attempts, no fourth spawn: {events:?}");
    assert_eq!(failures, 3);

    let feature = rig
        .project
        .catalog()
        .get_feature(f.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!feature.passes);
    assert!(!feature.in_progress, "claim must be cleared after each failure");
}

// ===========================================================================
// Resume
// ===========================================================================

#[tokio::test]
async fn interrupted_features_are_resumed_first() {
    let project = TestProject::new().await;
    // A previous session claimed `a` and died; `b` depends on it.
    let a = project.seed_interrupted_feature("a", 1, vec![]).await;
    let b = project.seed_feature("b", 1, vec![a.id]).await;
    assert!(a.in_progress);

    let mut rig = TestRig::new(project, "sleep 1\nexit 0\n", 2, 0)
        .await
        .with_auto_passer();

    tokio::time::timeout(Duration::from_secs(60), rig.orchestrator.run())
        .await
        .expect("session should finish")
        .expect("session should succeed");

    let events = rig.drain_events().await;
    // A fresh claim on `a` would have been refused (it was already
    // in-progress), so a successful run proves the resume path ran it.
    let a_run = position(&events, (a.id, AgentStatus::Running));
    let b_run = position(&events, (b.id, AgentStatus::Running));
    assert!(a_run < b_run);

    for f in rig.project.catalog().snapshot().await.unwrap() {
        assert!(f.passes);
    }
}

// ===========================================================================
// Dependency deadlock
// ===========================================================================

#[tokio::test]
async fn dependency_cycle_blocks_without_failing_the_session() {
    let project = TestProject::new().await;
    // a and b form a cycle; c is independent.
    let a = project.seed_feature("a", 1, vec![]).await;
    let b = project.seed_feature("b", 1, vec![a.id]).await;
    // Rewrite a's dependencies to point at b, closing the cycle.
    let a = {
        use sqlx::{ConnectOptions, Connection};
        let catalog = project.catalog().clone();
        let options = sqlx::sqlite::SqliteConnectOptions::new().filename(catalog.db_path());
        let mut conn = options.connect().await.unwrap();
        sqlx::query("UPDATE features SET dependencies = ?1 WHERE id = ?2")
            .bind(format!("[{}]", b.id))
            .bind(a.id)
            .execute(&mut conn)
            .await
            .unwrap();
        let _ = conn.close().await;
        catalog.get_feature(a.id).await.unwrap().unwrap()
    };
    let c = project.seed_feature("c", 1, vec![]).await;

    let mut rig = TestRig::new(project, "sleep 1\nexit 0\n", 2, 0)
        .await
        .with_auto_passer();

    let orchestrator = rig.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.run().await });

    // c completes; a and b stay permanently unready.
    let seen = rig
        .expect_event((c.id, AgentStatus::Completed), Duration::from_secs(30))
        .await;
    assert!(!seen.contains(&(a.id, AgentStatus::Running)));
    assert!(!seen.contains(&(b.id, AgentStatus::Running)));

    // The loop records the blocked notice and keeps waiting.
    let log_path = rig
        .project
        .path()
        .join(".drover")
        .join("orchestrator_debug.log");
    let mut noticed = false;
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(&log_path) {
            if contents.contains("blocked by dependencies") {
                noticed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(noticed, "expected the blocked-by-dependencies notice");

    // Externally stopped; not a fatal error.
    rig.orchestrator.shutdown();
    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("shutdown should unblock the loop")
        .expect("run task should not panic")
        .expect("blocked session still shuts down cleanly");

    let events = rig.drain_events().await;
    assert!(!events.contains(&(a.id, AgentStatus::Running)));
    assert!(!events.contains(&(b.id, AgentStatus::Running)));

    let status = rig.orchestrator.status();
    assert_eq!(status.coding_agent_count, 0);
    assert_eq!(status.testing_agent_count, 0);
}

// ===========================================================================
// Testing pool
// ===========================================================================

#[tokio::test]
async fn testing_pool_fills_and_refills() {
    let project = TestProject::new().await;
    project.seed_passing_feature("done-1").await;
    project.seed_passing_feature("done-2").await;
    // A forever-blocked feature keeps the session alive.
    project.seed_feature("blocked", 1, vec![9999]).await;

    let mut rig = TestRig::new(project, "sleep 1\nexit 0\n", 2, 2).await;

    let orchestrator = rig.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.run().await });

    // Fill: two testing agents within a few ticks.
    let mut filled = false;
    for _ in 0..100 {
        if rig.orchestrator.status().testing_agent_count == 2 {
            filled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(filled, "testing pool never reached its ratio");

    // Agents exit after a second; the completion event proves one died.
    let mut saw_completion = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while let Ok(Some((_, status))) = tokio::time::timeout_at(deadline, rig.events.recv()).await {
        if status == AgentStatus::Completed {
            saw_completion = true;
            break;
        }
    }
    assert!(saw_completion, "no testing agent completion observed");

    // The next maintenance pass refills to the ratio.
    let mut refilled = false;
    for _ in 0..100 {
        if rig.orchestrator.status().testing_agent_count == 2 {
            refilled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(refilled, "testing pool did not refill after agents exited");

    rig.orchestrator.shutdown();
    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("shutdown should unblock the loop")
        .expect("run task should not panic")
        .expect("session should shut down cleanly");

    // After stop_all both pools are empty.
    let status = rig.orchestrator.status();
    assert_eq!(status.coding_agent_count, 0);
    assert_eq!(status.testing_agent_count, 0);

    // Testing completions reference passing features only.
    let events = rig.drain_events().await;
    for (id, status) in &events {
        if *status == AgentStatus::Completed {
            let f = rig.project.catalog().get_feature(*id).await.unwrap().unwrap();
            assert!(f.passes, "testing status for non-passing feature {id}");
        }
    }
}

#[tokio::test]
async fn yolo_mode_keeps_the_testing_pool_empty() {
    let project = TestProject::new().await;
    project.seed_passing_feature("done").await;
    project.seed_feature("blocked", 1, vec![9999]).await;

    let worker_dir = TempDir::new().unwrap();
    let worker = write_worker_script(worker_dir.path(), "worker.sh", "sleep 1\nexit 0\n");
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            project_dir: project.path().to_path_buf(),
            worker,
            max_concurrency: 2,
            testing_agent_ratio: 2,
            model: None,
            yolo: true,
        },
        Arc::new(|_, _: &str| {}),
        Arc::new(|_, _| {}),
    );

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    for _ in 0..20 {
        assert_eq!(orchestrator.status().testing_agent_count, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    orchestrator.shutdown();
    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("shutdown should unblock the loop")
        .expect("run task should not panic")
        .expect("session should shut down cleanly");
}

// ===========================================================================
// Direct start/stop surface
// ===========================================================================

#[tokio::test]
async fn spawn_failure_releases_the_claim_without_charging_a_retry() {
    let project = TestProject::new().await;
    let f = project.seed_feature("a", 1, vec![]).await;

    let (status_tx, _status_rx) = mpsc::unbounded_channel::<Event>();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            project_dir: project.path().to_path_buf(),
            worker: PathBuf::from("/nonexistent/drover-worker"),
            max_concurrency: 2,
            testing_agent_ratio: 0,
            model: None,
            yolo: false,
        },
        Arc::new(|_, _: &str| {}),
        Arc::new(move |id, status| {
            let _ = status_tx.send((id, status));
        }),
    );

    let err = orchestrator.start_feature(f.id, false).await.unwrap_err();
    assert!(matches!(err, StartError::Spawn { id, .. } if id == f.id));

    // The claim was rolled back and the pool slot freed.
    let feature = project.catalog().get_feature(f.id).await.unwrap().unwrap();
    assert!(!feature.in_progress);
    assert_eq!(orchestrator.status().coding_agent_count, 0);

    // Still startable: the failure charged no retry.
    let err = orchestrator.start_feature(f.id, false).await.unwrap_err();
    assert!(matches!(err, StartError::Spawn { .. }));
}

#[tokio::test]
async fn one_coding_agent_per_feature_and_stop_restores_state() {
    let project = TestProject::new().await;
    let f = project.seed_feature("a", 1, vec![]).await;

    let mut rig = TestRig::new(project, "sleep 60\nexit 0\n", 2, 0).await;

    rig.orchestrator.start_feature(f.id, false).await.unwrap();
    let err = rig.orchestrator.start_feature(f.id, false).await.unwrap_err();
    assert!(matches!(
        err,
        StartError::Admission(AdmissionError::AlreadyRunning(id)) if id == f.id
    ));

    assert!(rig.orchestrator.stop_feature(f.id).await);
    assert!(!rig.orchestrator.stop_feature(9999).await);

    // The reaper removes the slot and clears the claim.
    let mut cleared = false;
    for _ in 0..100 {
        let feature = rig.project.catalog().get_feature(f.id).await.unwrap().unwrap();
        if rig.orchestrator.status().coding_agent_count == 0 && !feature.in_progress {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cleared, "stop should release the pool slot and the claim");

    // Start/stop/start round-trip: the feature is claimable again.
    rig.orchestrator.start_feature(f.id, false).await.unwrap();
    rig.orchestrator.stop_feature(f.id).await;
}

#[tokio::test]
async fn concurrency_cap_limits_fresh_starts() {
    let project = TestProject::new().await;
    let a = project.seed_feature("a", 1, vec![]).await;
    let b = project.seed_feature("b", 1, vec![]).await;
    let c = project.seed_feature("c", 1, vec![]).await;

    let rig = TestRig::new(project, "sleep 60\nexit 0\n", 2, 0).await;

    rig.orchestrator.start_feature(a.id, false).await.unwrap();
    rig.orchestrator.start_feature(b.id, false).await.unwrap();
    let err = rig.orchestrator.start_feature(c.id, false).await.unwrap_err();
    assert!(matches!(
        err,
        StartError::Admission(AdmissionError::AtMaxConcurrency(2))
    ));

    // `c` was never claimed by the refused admission.
    let feature = rig.project.catalog().get_feature(c.id).await.unwrap().unwrap();
    assert!(!feature.in_progress);

    rig.orchestrator.stop_all().await;
    let mut drained = false;
    for _ in 0..100 {
        if rig.orchestrator.status().coding_agent_count == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(drained, "stop_all should empty the coding pool");
}

#[tokio::test]
async fn fresh_claim_on_interrupted_feature_is_refused() {
    let project = TestProject::new().await;
    let f = project.seed_interrupted_feature("a", 1, vec![]).await;

    let rig = TestRig::new(project, "sleep 60\nexit 0\n", 2, 0).await;

    // Fresh-start path refuses; the resumable path is the only way in.
    let err = rig.orchestrator.start_feature(f.id, false).await.unwrap_err();
    assert!(matches!(
        err,
        StartError::ClaimRefused {
            outcome: drover_catalog::ClaimOutcome::AlreadyInProgress,
            ..
        }
    ));
    assert_eq!(rig.orchestrator.status().coding_agent_count, 0);

    rig.orchestrator.start_feature(f.id, true).await.unwrap();
    rig.orchestrator.stop_feature(f.id).await;
}
