use std::env;
use std::path::{Path, PathBuf};

/// Catalog location configuration.
///
/// The catalog lives at `.drover/features.db` inside the target project
/// directory unless `DROVER_CATALOG_PATH` points somewhere else.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl CatalogConfig {
    /// Directory component under the project dir that holds drover state.
    pub const STATE_DIR: &str = ".drover";

    /// File name of the catalog database.
    pub const DB_FILE: &str = "features.db";

    /// Build a config for a project directory.
    ///
    /// Priority: `DROVER_CATALOG_PATH` env var, then the conventional
    /// location inside the project.
    pub fn for_project(project_dir: &Path) -> Self {
        let db_path = env::var("DROVER_CATALOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_dir.join(Self::STATE_DIR).join(Self::DB_FILE));
        Self { db_path }
    }

    /// Build a config from an explicit database path (useful for tests).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}
