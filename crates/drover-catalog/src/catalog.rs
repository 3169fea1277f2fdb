//! The per-call-session catalog handle.

use std::path::Path;

use anyhow::Result;
use sqlx::{Connection, SqliteConnection};

use crate::config::CatalogConfig;
use crate::models::{ClaimOutcome, Feature, NewFeature, ResumeOutcome};
use crate::queries::features as q;
use crate::session;

/// Handle to the feature catalog.
///
/// Holds only the database location. Every operation opens a fresh
/// session and closes it on return, so reads always see rows committed
/// by worker subprocesses -- including rows the initializer committed
/// moments earlier from a different process.
#[derive(Debug, Clone)]
pub struct Catalog {
    config: CatalogConfig,
}

impl Catalog {
    /// Create a handle for a project directory (conventional DB location).
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            config: CatalogConfig::for_project(project_dir),
        }
    }

    /// Create a handle from an explicit config.
    pub fn new(config: CatalogConfig) -> Self {
        Self { config }
    }

    /// Path of the backing database file.
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    async fn open(&self) -> Result<SqliteConnection> {
        session::open(&self.config.db_path).await
    }

    async fn close(conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "error closing catalog session");
        }
    }

    /// Create the schema if missing. Called once at session startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.open().await?;
        let result = session::ensure_schema(&mut conn).await;
        Self::close(conn).await;
        result
    }

    /// Read the full catalog.
    pub async fn snapshot(&self) -> Result<Vec<Feature>> {
        let mut conn = self.open().await?;
        let result = q::list_features(&mut conn).await;
        Self::close(conn).await;
        result
    }

    /// Fetch one feature.
    pub async fn get_feature(&self, id: i64) -> Result<Option<Feature>> {
        let mut conn = self.open().await?;
        let result = q::get_feature(&mut conn, id).await;
        Self::close(conn).await;
        result
    }

    /// Insert a feature (initializer/test path).
    pub async fn insert_feature(&self, new: &NewFeature) -> Result<Feature> {
        let mut conn = self.open().await?;
        let result = q::insert_feature(&mut conn, new).await;
        Self::close(conn).await;
        result
    }

    /// Atomically claim a feature for a fresh coding run.
    pub async fn claim_for_coding(&self, id: i64) -> Result<ClaimOutcome> {
        let mut conn = self.open().await?;
        let result = q::claim_for_coding(&mut conn, id).await;
        Self::close(conn).await;
        result
    }

    /// Check that an interrupted feature is still resumable.
    pub async fn verify_resumable(&self, id: i64) -> Result<ResumeOutcome> {
        let mut conn = self.open().await?;
        let result = q::verify_resumable(&mut conn, id).await;
        Self::close(conn).await;
        result
    }

    /// Clear `in_progress` unless the feature already passes.
    pub async fn release_in_progress(&self, id: i64) -> Result<()> {
        let mut conn = self.open().await?;
        let result = q::release_in_progress(&mut conn, id).await;
        Self::close(conn).await;
        result
    }

    /// Mark a feature passing (worker-side transition; exposed for tests
    /// and tooling).
    pub async fn mark_passing(&self, id: i64) -> Result<()> {
        let mut conn = self.open().await?;
        let result = q::mark_passing(&mut conn, id).await;
        Self::close(conn).await;
        result
    }

    /// Count passing features.
    pub async fn count_passing(&self) -> Result<i64> {
        let mut conn = self.open().await?;
        let result = q::count_passing(&mut conn).await;
        Self::close(conn).await;
        result
    }

    /// Random passing feature with no coding agent attached.
    pub async fn random_passing_not_in_progress(&self) -> Result<Option<i64>> {
        let mut conn = self.open().await?;
        let result = q::random_passing_not_in_progress(&mut conn).await;
        Self::close(conn).await;
        result
    }

    /// Whether the catalog holds any features.
    pub async fn has_any_features(&self) -> Result<bool> {
        let mut conn = self.open().await?;
        let result = q::has_any_features(&mut conn).await;
        Self::close(conn).await;
        result
    }
}
