//! Shared test utilities for drover integration tests.
//!
//! Provides temporary project directories with a seeded catalog, plus
//! helpers for writing the fake worker scripts tests stand in for the
//! real worker binary.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use drover_catalog::{Catalog, Feature, NewFeature};

/// A temporary project directory with its catalog schema applied.
///
/// The directory (and the catalog inside it) is removed when the value
/// is dropped.
pub struct TestProject {
    dir: TempDir,
    catalog: Catalog,
}

impl TestProject {
    /// Create a fresh project directory and catalog.
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp project dir");
        let catalog = Catalog::for_project(dir.path());
        catalog
            .ensure_schema()
            .await
            .expect("catalog schema should apply");
        Self { dir, catalog }
    }

    /// Path of the project directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The project's catalog handle.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Insert a pending feature and return it.
    pub async fn seed_feature(&self, name: &str, priority: i64, dependencies: Vec<i64>) -> Feature {
        self.catalog
            .insert_feature(&NewFeature::new(name, priority, dependencies))
            .await
            .expect("failed to seed feature")
    }

    /// Insert a feature that already passes.
    pub async fn seed_passing_feature(&self, name: &str) -> Feature {
        let feature = self.seed_feature(name, 1, vec![]).await;
        self.catalog
            .mark_passing(feature.id)
            .await
            .expect("failed to mark feature passing");
        self.catalog
            .get_feature(feature.id)
            .await
            .expect("failed to re-read feature")
            .expect("feature should exist")
    }

    /// Insert a feature claimed by some previous (interrupted) session.
    pub async fn seed_interrupted_feature(
        &self,
        name: &str,
        priority: i64,
        dependencies: Vec<i64>,
    ) -> Feature {
        let feature = self.seed_feature(name, priority, dependencies).await;
        set_in_progress(&self.catalog, feature.id, true).await;
        self.catalog
            .get_feature(feature.id)
            .await
            .expect("failed to re-read feature")
            .expect("feature should exist")
    }
}

/// Force a feature's `in_progress` flag, bypassing the claim guards.
/// Only tests need this; the orchestrator goes through the claim path.
pub async fn set_in_progress(catalog: &Catalog, id: i64, in_progress: bool) {
    use sqlx::{ConnectOptions, Connection};

    let options = sqlx::sqlite::SqliteConnectOptions::new().filename(catalog.db_path());
    let mut conn = options.connect().await.expect("failed to open catalog");
    sqlx::query("UPDATE features SET in_progress = ?1 WHERE id = ?2")
        .bind(in_progress)
        .bind(id)
        .execute(&mut conn)
        .await
        .expect("failed to set in_progress");
    let _ = conn.close().await;
}

/// Write an executable `/bin/sh` script and return its path.
///
/// Fake workers stand in for the real worker binary; tests control their
/// behavior entirely through the script body.
pub fn write_worker_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write worker script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod worker script");
    }
    path
}
