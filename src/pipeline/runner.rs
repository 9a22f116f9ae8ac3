use std::time::Instant;

use crate::matcher::match_supplier_row;
use crate::oracle::{self, OracleMode};
use crate::registry::RegistryStore;

use super::checkpoint::CheckpointStore;
use super::input::{load_supplier_table, SupplierRow};
use super::{CancelFlag, PipelineConfig, PipelineOutcome, Result};

/// Load the input table and keep only the rows that still need work:
/// already-processed ids are removed first, then `limit_rows` bounds the
/// residual.
pub(super) fn plan_work(
    cfg: &PipelineConfig,
    state: &CheckpointStore,
) -> Result<Vec<SupplierRow>> {
    let table = load_supplier_table(&cfg.supplier_path, None)?;
    let skip = state.get_processed_ids(!cfg.retry_errors)?;
    tracing::info!("found {} already processed ids", skip.len());

    let mut work: Vec<SupplierRow> = table
        .rows
        .into_iter()
        .filter(|row| !skip.contains(&row.input_id()))
        .collect();
    if let Some(limit) = cfg.limit_rows {
        tracing::info!("limiting to {} new rows", limit);
        work.truncate(limit);
    }
    Ok(work)
}

pub(super) fn log_oracle_mode(mode: OracleMode) {
    match mode {
        OracleMode::Remote => tracing::info!("credential found, using the remote cleaning oracle"),
        OracleMode::Offline => tracing::info!("no credential found, using the offline cleaning oracle"),
    }
}

pub(super) fn log_progress(done: usize, total: usize, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        done as f64 / elapsed
    } else {
        0.0
    };
    let eta_mins = if rate > 0.0 {
        (total.saturating_sub(done)) as f64 / rate / 60.0
    } else {
        0.0
    };
    tracing::info!("{done}/{total} | rate={rate:.1}/s | ETA={eta_mins:.1}m");
}

/// Single-threaded pipeline: one registry handle, one oracle, batched
/// commits. Slower than the parallel driver but easier to reason about.
pub fn run_pipeline(cfg: &PipelineConfig, cancel: &CancelFlag) -> Result<PipelineOutcome> {
    let started = Instant::now();

    let mut state = CheckpointStore::open_or_fallback(&cfg.checkpoint_path)?;
    let work = plan_work(cfg, &state)?;
    let total = work.len();
    tracing::info!("rows to process: {total}");

    if total == 0 {
        state.export(&cfg.output_csv)?;
        return Ok(PipelineOutcome::default());
    }

    let store = RegistryStore::open(&cfg.registry_db)?;
    let mode = OracleMode::from_env();
    log_oracle_mode(mode);
    let mut oracle = oracle::build(mode, cfg.oracle_timeout_secs);

    let batch_size = cfg.batch_size.max(1);
    let mut processed = 0usize;
    let mut interrupted = false;

    for raw in work {
        if cancel.is_cancelled() {
            interrupted = true;
            tracing::warn!("interrupted, flushing progress ({processed}/{total} processed)");
            break;
        }
        let input_id = raw.input_id();
        match match_supplier_row(&store, &raw, oracle.as_mut()) {
            Ok(result) => state.upsert_result(&result)?,
            Err(err) => {
                tracing::warn!("row {input_id} failed: {err}");
                state.upsert_error(&input_id, &err.to_string())?;
            }
        }
        processed += 1;
        if processed % batch_size == 0 {
            state.commit()?;
            log_progress(processed, total, started);
        }
    }

    state.commit()?;
    state.export(&cfg.output_csv)?;
    tracing::info!(
        "finished: {processed} rows in {:.1}min (checkpoint={})",
        started.elapsed().as_secs_f64() / 60.0,
        state.path().display()
    );
    Ok(PipelineOutcome {
        processed,
        interrupted,
    })
}
