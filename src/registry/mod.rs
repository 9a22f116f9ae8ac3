mod builder;
mod frames;
mod model;
mod store;

pub use builder::{build_registry, BuildOptions};
pub use model::{Company, Establishment, FtsCandidate};
pub use store::RegistryStore;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    PolarsError(#[from] polars::prelude::PolarsError),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("registry database not found: {0}")]
    DatabaseNotFound(String),

    #[error("registry metadata is missing key: {0}")]
    MissingMetadata(String),

    #[error("invalid source data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Default number of FTS candidates returned by a broad search.
pub const DEFAULT_FTS_LIMIT: usize = 20;

/// Name-distance threshold for the strict local lookup.
pub const STRICT_NAME_DISTANCE: usize = 3;

/// Locations of the source archives and derived artifacts.
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    /// Company archive (one row per legal unit).
    pub companies_parquet: PathBuf,
    /// Establishment archive (one row per physical site).
    pub establishments_parquet: PathBuf,
    /// Analytical database file (active companies + FTS + metadata).
    pub db_path: PathBuf,
    /// Root directory of the establishment partition tree.
    pub partitions_dir: PathBuf,
}

impl Default for RegistryPaths {
    fn default() -> Self {
        Self {
            companies_parquet: PathBuf::from("StockUniteLegale_utf8.parquet"),
            establishments_parquet: PathBuf::from("StockEtablissement_utf8.parquet"),
            db_path: PathBuf::from("sirene.db"),
            partitions_dir: PathBuf::from("sirene_partitions"),
        }
    }
}

impl RegistryPaths {
    /// Directory that holds the `region_prefix=XX` partition directories.
    pub fn partitions_root(&self) -> PathBuf {
        self.partitions_dir.join("etablissements")
    }
}
