//! Query functions for the `features` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;

use crate::models::{ClaimOutcome, Feature, FeatureRow, NewFeature, ResumeOutcome};

/// Insert a new feature row. Returns the inserted feature.
pub async fn insert_feature(conn: &mut SqliteConnection, new: &NewFeature) -> Result<Feature> {
    let deps_json =
        serde_json::to_string(&new.dependencies).context("failed to encode dependencies")?;

    let row = sqlx::query_as::<_, FeatureRow>(
        "INSERT INTO features (name, description, category, priority, dependencies, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.category)
    .bind(new.priority)
    .bind(&deps_json)
    .bind(Utc::now())
    .fetch_one(conn)
    .await
    .context("failed to insert feature")?;

    Ok(row.into_feature())
}

/// Fetch a single feature by id.
pub async fn get_feature(conn: &mut SqliteConnection, id: i64) -> Result<Option<Feature>> {
    let row = sqlx::query_as::<_, FeatureRow>("SELECT * FROM features WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch feature")?;

    Ok(row.map(FeatureRow::into_feature))
}

/// List every feature, ordered by id.
pub async fn list_features(conn: &mut SqliteConnection) -> Result<Vec<Feature>> {
    let rows = sqlx::query_as::<_, FeatureRow>("SELECT * FROM features ORDER BY id ASC")
        .fetch_all(conn)
        .await
        .context("failed to list features")?;

    Ok(rows.into_iter().map(FeatureRow::into_feature).collect())
}

/// Atomically claim a feature for a fresh coding run.
///
/// The UPDATE is guarded on `passes = 0 AND in_progress = 0`; when no row
/// changes, a diagnostic read reports why the claim was refused.
pub async fn claim_for_coding(conn: &mut SqliteConnection, id: i64) -> Result<ClaimOutcome> {
    let result = sqlx::query(
        "UPDATE features SET in_progress = 1 \
         WHERE id = ?1 AND passes = 0 AND in_progress = 0",
    )
    .bind(id)
    .execute(&mut *conn)
    .await
    .context("failed to claim feature")?;

    if result.rows_affected() == 1 {
        return Ok(ClaimOutcome::Claimed);
    }

    match get_feature(conn, id).await? {
        None => Ok(ClaimOutcome::NotFound),
        Some(f) if f.passes => Ok(ClaimOutcome::AlreadyPasses),
        Some(_) => Ok(ClaimOutcome::AlreadyInProgress),
    }
}

/// Check that a feature interrupted in a previous session can be resumed:
/// still marked in-progress and not passing.
pub async fn verify_resumable(conn: &mut SqliteConnection, id: i64) -> Result<ResumeOutcome> {
    match get_feature(conn, id).await? {
        None => Ok(ResumeOutcome::NotFound),
        Some(f) if f.passes => Ok(ResumeOutcome::AlreadyPasses),
        Some(f) if !f.in_progress => Ok(ResumeOutcome::NotInProgress),
        Some(_) => Ok(ResumeOutcome::Resumable),
    }
}

/// Clear `in_progress`, but only while the feature has not passed.
/// Workers set `passes` before clearing `in_progress`; this is the repair
/// path for agents that exited without finishing.
pub async fn release_in_progress(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("UPDATE features SET in_progress = 0 WHERE id = ?1 AND passes = 0")
        .bind(id)
        .execute(conn)
        .await
        .context("failed to release in-progress flag")?;

    Ok(())
}

/// Mark a feature as passing and clear its in-progress flag.
///
/// This is the transition the worker itself commits; the orchestrator
/// only calls it from tests and tooling.
pub async fn mark_passing(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    let result = sqlx::query("UPDATE features SET passes = 1, in_progress = 0 WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await
        .context("failed to mark feature passing")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("feature {id} not found");
    }

    Ok(())
}

/// Count features with `passes = 1`.
pub async fn count_passing(conn: &mut SqliteConnection) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM features WHERE passes = 1")
        .fetch_one(conn)
        .await
        .context("failed to count passing features")?;

    Ok(row.0)
}

/// Count all features.
pub async fn count_features(conn: &mut SqliteConnection) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM features")
        .fetch_one(conn)
        .await
        .context("failed to count features")?;

    Ok(row.0)
}

/// Pick a uniformly random passing feature that no coding agent currently
/// claims. Returns `None` when no such feature exists.
pub async fn random_passing_not_in_progress(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM features \
         WHERE passes = 1 AND in_progress = 0 \
         ORDER BY RANDOM() LIMIT 1",
    )
    .fetch_optional(conn)
    .await
    .context("failed to pick random passing feature")?;

    Ok(row.map(|(id,)| id))
}

/// Whether the catalog holds any features at all.
pub async fn has_any_features(conn: &mut SqliteConnection) -> Result<bool> {
    Ok(count_features(conn).await? > 0)
}
