// Module definitions
pub mod matcher;
pub mod oracle;
pub mod pipeline;
pub mod preprocess;
pub mod registry;
pub mod websearch;

// Re-export main types and functions
pub use matcher::{match_supplier_row, MatchMethod, MatchResult};
pub use oracle::{CleaningOracle, OfflineOracle, RemoteOracle};
pub use pipeline::{run_pipeline, run_pipeline_parallel, run_unified, CheckpointStore};
pub use registry::{build_registry, RegistryStore};
