mod checkpoint;
mod input;
mod parallel;
mod report;
mod runner;
mod unified;

pub use checkpoint::{CheckpointRow, CheckpointStore};
pub use input::{load_supplier_table, Scalar, SupplierRow, SupplierTable};
pub use parallel::run_pipeline_parallel;
pub use report::{combine_reports, write_report, ReportRow, REPORT_COLUMNS};
pub use runner::run_pipeline;
pub use unified::{run_unified, UnifiedConfig};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Polars error: {0}")]
    PolarsError(#[from] polars::prelude::PolarsError),

    #[error("checkpoint error: {0}")]
    CheckpointError(#[from] rusqlite::Error),

    #[error("registry error: {0}")]
    RegistryError(#[from] crate::registry::RegistryError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// Default constants for pipeline configuration
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub supplier_path: PathBuf,
    pub registry_db: PathBuf,
    pub checkpoint_path: PathBuf,
    pub output_csv: PathBuf,
    /// Outcomes between two durable checkpoint commits.
    pub batch_size: usize,
    /// Applied to the residual work after already-processed ids are removed.
    pub limit_rows: Option<usize>,
    /// Replay ids whose last record was an error.
    pub retry_errors: bool,
    /// Optional inter-submission delay in seconds, distributed across workers.
    pub rate_limit_delay: f64,
    /// Per-call timeout for the remote cleaning oracle.
    pub oracle_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            supplier_path: PathBuf::from("Frs.xlsx"),
            registry_db: PathBuf::from("sirene.db"),
            checkpoint_path: PathBuf::from("state.sqlite"),
            output_csv: PathBuf::from("results_enriched.csv"),
            batch_size: DEFAULT_BATCH_SIZE,
            limit_rows: None,
            retry_errors: false,
            rate_limit_delay: 0.0,
            oracle_timeout_secs: DEFAULT_ORACLE_TIMEOUT_SECS,
        }
    }
}

/// Cooperative cancellation signal shared between the driver, the workers
/// and the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a pipeline run did. Interruption is not an error: progress has been
/// flushed and the caller decides the exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOutcome {
    pub processed: usize,
    pub interrupted: bool,
}
