use std::path::PathBuf;

use clap::{Parser, Subcommand};

use sirene_rs::pipeline::{CancelFlag, PipelineConfig, PipelineOutcome, UnifiedConfig};
use sirene_rs::registry::{BuildOptions, RegistryPaths};

/// Exit code after a user interruption, once progress has been flushed.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "sirene")]
#[command(about = "SIRENE-RS - supplier resolution against the SIRENE registry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the registry store from the source archives
    BuildDb {
        /// Company archive (parquet)
        #[arg(long, default_value = "StockUniteLegale_utf8.parquet")]
        companies_parquet: PathBuf,

        /// Establishment archive (parquet)
        #[arg(long, default_value = "StockEtablissement_utf8.parquet")]
        establishments_parquet: PathBuf,

        /// Analytical database file to create
        #[arg(short, long, default_value = "sirene.db")]
        db_path: PathBuf,

        /// Directory for the establishment partition tree
        #[arg(short, long, default_value = "sirene_partitions")]
        partitions_dir: PathBuf,

        /// Build from a bounded sample of each archive (dev/tests)
        #[arg(long)]
        sample_rows: Option<usize>,

        /// Rebuild even when artifacts already exist
        #[arg(short, long)]
        force: bool,
    },

    /// Run the resolution pipeline sequentially (slower but simpler)
    Sequential {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Run the resolution pipeline in parallel (recommended)
    Parallel {
        #[command(flatten)]
        run: RunArgs,

        /// Number of workers (default: CPU count)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Inter-submission delay in seconds, spread across workers
        #[arg(long, default_value_t = 0.0)]
        rate_limit_delay: f64,
    },

    /// Run preprocessing + registry matching + web search end to end
    Unified {
        /// Input file (Excel, CSV, or Parquet)
        #[arg(short, long, default_value = "Frs.xlsx")]
        input: PathBuf,

        /// Registry database file
        #[arg(short, long, default_value = "sirene.db")]
        db_path: PathBuf,

        /// Directory for all outputs
        #[arg(short, long, default_value = "results")]
        output_dir: PathBuf,

        /// Matcher workers (default: CPU count)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Web search workers
        #[arg(long, default_value_t = 10)]
        websearch_workers: usize,

        /// Delay between web search calls in seconds
        #[arg(long, default_value_t = 0.0)]
        websearch_rate_limit: f64,

        /// Limit the number of input rows
        #[arg(short, long)]
        limit_rows: Option<usize>,

        #[arg(long)]
        skip_preprocess: bool,

        #[arg(long)]
        skip_sirene: bool,

        #[arg(long)]
        skip_websearch: bool,

        /// Keep suppliers without a last-movement date
        #[arg(long)]
        no_filter_inactive: bool,

        /// Delete output files left by a previous run before starting
        #[arg(long)]
        clean_output: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Supplier table (Excel, CSV, or Parquet)
    #[arg(short, long, default_value = "Frs.xlsx")]
    supplier: PathBuf,

    /// Registry database file
    #[arg(short, long, default_value = "sirene.db")]
    db_path: PathBuf,

    /// Checkpoint store path
    #[arg(short, long, default_value = "state.sqlite")]
    checkpoint: PathBuf,

    /// Report CSV path
    #[arg(short, long, default_value = "results_enriched.csv")]
    output_csv: PathBuf,

    /// Outcomes between two checkpoint commits
    #[arg(short, long, default_value_t = 100)]
    batch_size: usize,

    /// Limit the number of new rows to process
    #[arg(short, long)]
    limit_rows: Option<usize>,

    /// Replay rows whose last record was an error
    #[arg(long)]
    retry_errors: bool,

    /// Per-call timeout for the remote oracle, in seconds
    #[arg(long, default_value_t = 30)]
    oracle_timeout: u64,
}

impl RunArgs {
    fn to_config(&self, rate_limit_delay: f64) -> PipelineConfig {
        PipelineConfig {
            supplier_path: self.supplier.clone(),
            registry_db: self.db_path.clone(),
            checkpoint_path: self.checkpoint.clone(),
            output_csv: self.output_csv.clone(),
            batch_size: self.batch_size,
            limit_rows: self.limit_rows,
            retry_errors: self.retry_errors,
            rate_limit_delay,
            oracle_timeout_secs: self.oracle_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, flushing progress...");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::BuildDb {
            companies_parquet,
            establishments_parquet,
            db_path,
            partitions_dir,
            sample_rows,
            force,
        } => {
            let paths = RegistryPaths {
                companies_parquet,
                establishments_parquet,
                db_path,
                partitions_dir,
            };
            let opts = BuildOptions {
                sample_rows,
                force_rebuild: force,
            };
            tokio::task::spawn_blocking(move || sirene_rs::build_registry(&paths, &opts))
                .await??;
        }

        Commands::Sequential { run } => {
            let cfg = run.to_config(0.0);
            let outcome = tokio::task::spawn_blocking({
                let cancel = cancel.clone();
                move || sirene_rs::run_pipeline(&cfg, &cancel)
            })
            .await??;
            finish(outcome);
        }

        Commands::Parallel {
            run,
            workers,
            rate_limit_delay,
        } => {
            let cfg = run.to_config(rate_limit_delay);
            let workers = workers.unwrap_or_else(num_cpus::get);
            let outcome = tokio::task::spawn_blocking({
                let cancel = cancel.clone();
                move || sirene_rs::run_pipeline_parallel(&cfg, workers, &cancel)
            })
            .await??;
            finish(outcome);
        }

        Commands::Unified {
            input,
            db_path,
            output_dir,
            workers,
            websearch_workers,
            websearch_rate_limit,
            limit_rows,
            skip_preprocess,
            skip_sirene,
            skip_websearch,
            no_filter_inactive,
            clean_output,
        } => {
            let cfg = UnifiedConfig {
                input_path: input,
                registry_db: db_path,
                output_dir,
                workers: workers.unwrap_or_else(num_cpus::get),
                websearch_workers,
                websearch_rate_limit,
                limit_rows,
                skip_preprocess,
                skip_sirene,
                skip_websearch,
                filter_inactive: !no_filter_inactive,
                clean_output,
                ..UnifiedConfig::default()
            };
            let outcome = tokio::task::spawn_blocking({
                let cancel = cancel.clone();
                move || sirene_rs::run_unified(&cfg, &cancel)
            })
            .await??;
            finish(outcome);
        }
    }

    Ok(())
}

/// Interruption is not a failure, but it gets its own exit code so callers
/// can tell a flushed-and-stopped run from a completed one.
fn finish(outcome: PipelineOutcome) {
    if outcome.interrupted {
        tracing::info!("stopped after {} rows; rerun to resume", outcome.processed);
        std::process::exit(EXIT_INTERRUPTED);
    }
}
