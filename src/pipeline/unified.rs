//! The end-to-end command: preprocessing, registry matching on the domestic
//! split, web search on the rest, and one combined report.

use std::fs;
use std::path::PathBuf;

use crate::oracle::API_KEY_VAR;
use crate::preprocess;
use crate::websearch;

use super::report::combine_reports;
use super::{
    load_supplier_table, run_pipeline_parallel, CancelFlag, PipelineConfig, PipelineError,
    PipelineOutcome, Result, DEFAULT_ORACLE_TIMEOUT_SECS,
};

#[derive(Debug, Clone)]
pub struct UnifiedConfig {
    pub input_path: PathBuf,
    pub registry_db: PathBuf,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub websearch_workers: usize,
    pub websearch_rate_limit: f64,
    pub limit_rows: Option<usize>,
    pub skip_preprocess: bool,
    pub skip_sirene: bool,
    pub skip_websearch: bool,
    pub filter_inactive: bool,
    /// Delete output files left by a previous run instead of warning.
    pub clean_output: bool,
    pub oracle_timeout_secs: u64,
}

impl Default for UnifiedConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("Frs.xlsx"),
            registry_db: PathBuf::from("sirene.db"),
            output_dir: PathBuf::from("results"),
            workers: num_cpus::get(),
            websearch_workers: websearch::DEFAULT_WEBSEARCH_WORKERS,
            websearch_rate_limit: 0.0,
            limit_rows: None,
            skip_preprocess: false,
            skip_sirene: false,
            skip_websearch: false,
            filter_inactive: true,
            clean_output: false,
            oracle_timeout_secs: DEFAULT_ORACLE_TIMEOUT_SECS,
        }
    }
}

pub fn run_unified(cfg: &UnifiedConfig, cancel: &CancelFlag) -> Result<PipelineOutcome> {
    fs::create_dir_all(&cfg.output_dir)?;
    let domestic_csv = cfg.output_dir.join("results_french_sirene.csv");
    let foreign_csv = cfg.output_dir.join("results_non_french_google.csv");
    let combined_csv = cfg.output_dir.join("results_combined.csv");
    let preprocessed_dir = cfg.output_dir.join("preprocessed");

    // Stale outputs from an earlier run would silently merge with fresh
    // results in the combine step.
    let stale: Vec<&PathBuf> = [&domestic_csv, &foreign_csv, &combined_csv]
        .into_iter()
        .filter(|p| p.exists())
        .collect();
    if !stale.is_empty() {
        if cfg.clean_output {
            for path in stale {
                fs::remove_file(path)?;
                tracing::info!("deleted stale output {}", path.display());
            }
        } else {
            for path in stale {
                tracing::warn!(
                    "output {} is left over from a previous run and will be merged; \
                     pass --clean-output to delete it first",
                    path.display()
                );
            }
        }
    }

    // Step 1: preprocessing.
    let (french_path, non_french_path) = if cfg.skip_preprocess {
        let french = preprocessed_dir.join("suppliers_french.csv");
        let non_french = preprocessed_dir.join("suppliers_non_french.csv");
        if !french.exists() || !non_french.exists() {
            return Err(PipelineError::InvalidInput(format!(
                "preprocessed files not found under {}",
                preprocessed_dir.display()
            )));
        }
        tracing::info!("skipping preprocessing, reusing {}", preprocessed_dir.display());
        (french, non_french)
    } else {
        let (french, non_french, stats) = preprocess::preprocess_suppliers(
            &cfg.input_path,
            &preprocessed_dir,
            cfg.filter_inactive,
            cfg.limit_rows,
        )
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        tracing::info!(
            "preprocessing complete: {} french, {} non-french",
            stats.french_suppliers,
            stats.non_french_suppliers
        );
        (french, non_french)
    };

    let mut outcome = PipelineOutcome::default();

    // Step 2: registry matching on the domestic split.
    if cfg.skip_sirene {
        tracing::info!("skipping registry matching");
    } else {
        let pipeline_cfg = PipelineConfig {
            supplier_path: french_path,
            registry_db: cfg.registry_db.clone(),
            checkpoint_path: cfg.output_dir.join("checkpoint_french.sqlite"),
            output_csv: domestic_csv.clone(),
            oracle_timeout_secs: cfg.oracle_timeout_secs,
            ..PipelineConfig::default()
        };
        let sirene = run_pipeline_parallel(&pipeline_cfg, cfg.workers, cancel)?;
        outcome.processed += sirene.processed;
        if sirene.interrupted {
            outcome.interrupted = true;
            return Ok(outcome);
        }
    }

    // Step 3: web search on the rest. Without a credential the branch is
    // skipped, not fatal: the domestic results still stand.
    if cfg.skip_websearch {
        tracing::info!("skipping web search");
    } else if std::env::var(API_KEY_VAR).map(|k| k.trim().is_empty()).unwrap_or(true) {
        tracing::warn!("{API_KEY_VAR} not set, skipping the web search branch");
    } else {
        let table = load_supplier_table(&non_french_path, None)?;
        match websearch::run_websearch(
            &table,
            &foreign_csv,
            cfg.websearch_workers,
            cfg.websearch_rate_limit,
            cfg.oracle_timeout_secs,
            cancel,
        ) {
            Ok(count) => outcome.processed += count,
            Err(err) => tracing::error!("web search failed: {err}"),
        }
        if cancel.is_cancelled() {
            outcome.interrupted = true;
            return Ok(outcome);
        }
    }

    // Step 4: combine whatever was produced.
    let written = combine_reports(&[domestic_csv.as_path(), foreign_csv.as_path()], &combined_csv)?;
    tracing::info!("combined report: {} rows in {}", written, combined_csv.display());

    Ok(outcome)
}
