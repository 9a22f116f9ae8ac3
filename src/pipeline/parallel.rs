//! Parallel pipeline driver: N workers, each an OS thread with its own
//! read-only registry handle and its own oracle instance, fed from a shared
//! task queue. The driver is the only writer to the checkpoint store and
//! integrates outcomes in completion order.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};

use crate::matcher::{match_supplier_row, MatchResult};
use crate::oracle::{self, OracleMode};
use crate::registry::RegistryStore;

use super::checkpoint::CheckpointStore;
use super::input::SupplierRow;
use super::runner::{log_oracle_mode, log_progress, plan_work};
use super::{CancelFlag, PipelineConfig, PipelineOutcome, Result};

/// How long the driver waits for in-flight rows after a cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Driver poll interval while waiting for outcomes.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Outcome {
    input_id: String,
    result: std::result::Result<MatchResult, String>,
}

pub fn run_pipeline_parallel(
    cfg: &PipelineConfig,
    num_workers: usize,
    cancel: &CancelFlag,
) -> Result<PipelineOutcome> {
    let started = Instant::now();

    let mut state = CheckpointStore::open_or_fallback(&cfg.checkpoint_path)?;
    let work = plan_work(cfg, &state)?;
    let total = work.len();
    tracing::info!("rows to process: {total}");

    if total == 0 {
        state.export(&cfg.output_csv)?;
        return Ok(PipelineOutcome::default());
    }

    // Fail fast on an unreadable registry before spawning anything.
    drop(RegistryStore::open(&cfg.registry_db)?);

    let num_workers = num_workers.clamp(1, total);
    let mode = OracleMode::from_env();
    log_oracle_mode(mode);
    tracing::info!("starting {num_workers} workers");

    let (task_tx, task_rx) = bounded::<SupplierRow>(num_workers * 2);
    let (out_tx, out_rx) = unbounded::<Outcome>();

    let mut workers = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let task_rx = task_rx.clone();
        let out_tx = out_tx.clone();
        let cancel = cancel.clone();
        let registry_db = cfg.registry_db.clone();
        let timeout = cfg.oracle_timeout_secs;
        workers.push(std::thread::spawn(move || {
            worker_loop(worker_id, registry_db, mode, timeout, task_rx, out_tx, cancel)
        }));
    }
    drop(task_rx);
    drop(out_tx);

    // Dispatch from a separate thread so the driver can integrate outcomes
    // while the queue refills. The optional rate-limit delay is spread
    // evenly across workers.
    let submit_delay = (cfg.rate_limit_delay > 0.0)
        .then(|| Duration::from_secs_f64(cfg.rate_limit_delay / num_workers as f64));
    let dispatch_cancel = cancel.clone();
    let dispatcher = std::thread::spawn(move || {
        for row in work {
            if dispatch_cancel.is_cancelled() {
                break;
            }
            if let Some(delay) = submit_delay {
                std::thread::sleep(delay);
            }
            if task_tx.send(row).is_err() {
                break;
            }
        }
    });

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("matching [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let batch_size = cfg.batch_size.max(1);
    let mut processed = 0usize;
    let mut interrupted = false;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() && grace_deadline.is_none() {
            interrupted = true;
            grace_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
            tracing::warn!("interrupted, awaiting in-flight rows ({processed}/{total} processed)");
        }
        if grace_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::warn!("grace period elapsed, abandoning in-flight rows");
            break;
        }
        match out_rx.recv_timeout(POLL_INTERVAL) {
            Ok(outcome) => {
                match outcome.result {
                    Ok(result) => state.upsert_result(&result)?,
                    Err(error) => state.upsert_error(&outcome.input_id, &error)?,
                }
                processed += 1;
                bar.inc(1);
                if processed % batch_size == 0 {
                    state.commit()?;
                    log_progress(processed, total, started);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    bar.finish_and_clear();

    state.commit()?;
    state.export(&cfg.output_csv)?;

    if interrupted {
        // Workers stuck on an oracle call are abandoned; the process is
        // about to exit and their rows were never written.
        tracing::info!("progress saved to {}; rerun to resume", state.path().display());
    } else {
        let _ = dispatcher.join();
        for worker in workers {
            let _ = worker.join();
        }
        tracing::info!(
            "finished: {processed} rows with {num_workers} workers in {:.1}min",
            started.elapsed().as_secs_f64() / 60.0
        );
    }

    Ok(PipelineOutcome {
        processed,
        interrupted,
    })
}

fn worker_loop(
    worker_id: usize,
    registry_db: PathBuf,
    mode: OracleMode,
    oracle_timeout_secs: u64,
    task_rx: Receiver<SupplierRow>,
    out_tx: Sender<Outcome>,
    cancel: CancelFlag,
) {
    let store = match RegistryStore::open(&registry_db) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!("worker {worker_id}: cannot open registry: {err}");
            return;
        }
    };
    let mut oracle = oracle::build(mode, oracle_timeout_secs);

    while let Ok(raw) = task_rx.recv() {
        if cancel.is_cancelled() {
            break;
        }
        let input_id = raw.input_id();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            match_supplier_row(&store, &raw, oracle.as_mut())
        }));
        let outcome = match result {
            Ok(Ok(result)) => Outcome {
                input_id,
                result: Ok(result),
            },
            Ok(Err(err)) => Outcome {
                input_id,
                result: Err(err.to_string()),
            },
            Err(_) => Outcome {
                input_id,
                result: Err("worker panicked while matching".to_string()),
            },
        };
        if out_tx.send(outcome).is_err() {
            break;
        }
    }
}
