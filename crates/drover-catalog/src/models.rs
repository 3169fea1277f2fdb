use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A unit of work tracked in the catalog.
///
/// `dependencies` is stored as a JSON array of feature ids in a TEXT
/// column; [`FeatureRow`] carries the raw form and is converted on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Free-form grouping label; opaque to the scheduler.
    pub category: String,
    /// Lower sorts earlier.
    pub priority: i64,
    /// Ids of features that must pass before this one is ready.
    pub dependencies: Vec<i64>,
    /// True once the feature has been implemented and verified.
    pub passes: bool,
    /// True while a coding agent is claiming the feature.
    pub in_progress: bool,
    pub created_at: DateTime<Utc>,
}

/// Raw database row for a feature, before JSON decoding.
#[derive(Debug, Clone, FromRow)]
pub struct FeatureRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub dependencies: String,
    pub passes: bool,
    pub in_progress: bool,
    pub created_at: DateTime<Utc>,
}

impl FeatureRow {
    /// Decode the JSON dependency list. A malformed or empty list decodes
    /// to no dependencies rather than failing the whole read.
    pub fn into_feature(self) -> Feature {
        let dependencies: Vec<i64> = serde_json::from_str(&self.dependencies).unwrap_or_default();
        Feature {
            id: self.id,
            name: self.name,
            description: self.description,
            category: self.category,
            priority: self.priority,
            dependencies,
            passes: self.passes,
            in_progress: self.in_progress,
            created_at: self.created_at,
        }
    }
}

/// Fields for inserting a new feature (id and timestamps are generated).
#[derive(Debug, Clone)]
pub struct NewFeature {
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub dependencies: Vec<i64>,
}

impl NewFeature {
    /// Minimal constructor used by tests and seeding code.
    pub fn new(name: impl Into<String>, priority: i64, dependencies: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: "core".to_string(),
            priority,
            dependencies,
        }
    }
}

/// Result of attempting to claim a feature for a fresh coding run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The feature was atomically marked in-progress.
    Claimed,
    NotFound,
    AlreadyPasses,
    AlreadyInProgress,
}

impl fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claimed => "claimed",
            Self::NotFound => "not found",
            Self::AlreadyPasses => "already passes",
            Self::AlreadyInProgress => "already in progress",
        };
        f.write_str(s)
    }
}

/// Result of checking that an interrupted feature can be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The feature is still marked in-progress and not passing.
    Resumable,
    NotFound,
    AlreadyPasses,
    NotInProgress,
}

impl fmt::Display for ResumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resumable => "resumable",
            Self::NotFound => "not found",
            Self::AlreadyPasses => "already passes",
            Self::NotInProgress => "not in progress",
        };
        f.write_str(s)
    }
}
