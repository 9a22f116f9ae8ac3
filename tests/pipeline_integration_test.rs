//! End-to-end pipeline runs: coverage, resume, schema, worker-count
//! insensitivity.

mod common;

use std::collections::BTreeMap;
use std::path::Path;

use common::{build_fixture_registry, write_supplier_csv, SIRET_NORD};
use sirene_rs::matcher::{MatchMethod, MatchResult};
use sirene_rs::pipeline::{
    run_pipeline, run_pipeline_parallel, CancelFlag, CheckpointStore, PipelineConfig,
    REPORT_COLUMNS,
};
use tempfile::TempDir;

fn pipeline_config(dir: &Path, registry_db: &Path, tag: &str) -> PipelineConfig {
    PipelineConfig {
        supplier_path: dir.join("suppliers.csv"),
        registry_db: registry_db.to_path_buf(),
        checkpoint_path: dir.join(format!("state_{tag}.sqlite")),
        output_csv: dir.join(format!("results_{tag}.csv")),
        batch_size: 1,
        ..PipelineConfig::default()
    }
}

fn read_report(path: &Path) -> Vec<BTreeMap<String, String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(headers, REPORT_COLUMNS, "report schema must be stable");
    reader
        .records()
        .map(|record| {
            let record = record.unwrap();
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(String::from))
                .collect()
        })
        .collect()
}

#[test]
fn test_sequential_end_to_end() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    write_supplier_csv(&dir.path().join("suppliers.csv"));
    let cfg = pipeline_config(dir.path(), &paths.db_path, "seq");

    let outcome = run_pipeline(&cfg, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.processed, 2);
    assert!(!outcome.interrupted);

    let rows = read_report(&cfg.output_csv);
    assert_eq!(rows.len(), 2);

    let s1 = rows.iter().find(|r| r["input_id"] == "S1").unwrap();
    assert_eq!(s1["resolved_siret"], SIRET_NORD);
    assert_eq!(s1["match_method"], "DIRECT_ID");
    assert_eq!(s1["confidence_score"], "1.0");
    assert_eq!(s1["alternatives"], "[]");
    assert_eq!(s1["error"], "");
    assert_eq!(s1["found_website"], "");

    let s2 = rows.iter().find(|r| r["input_id"] == "S2").unwrap();
    assert_eq!(s2["resolved_siret"], "");
    assert_eq!(s2["match_method"], "NOT_FOUND");
    assert_eq!(s2["confidence_score"], "0.0");
}

#[test]
fn test_resume_processes_only_the_residual() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    write_supplier_csv(&dir.path().join("suppliers.csv"));
    let mut cfg = pipeline_config(dir.path(), &paths.db_path, "resume");

    // First run handles one row only.
    cfg.limit_rows = Some(1);
    let first = run_pipeline(&cfg, &CancelFlag::new()).unwrap();
    assert_eq!(first.processed, 1);

    // Second run picks up exactly the remaining row.
    cfg.limit_rows = None;
    let second = run_pipeline(&cfg, &CancelFlag::new()).unwrap();
    assert_eq!(second.processed, 1);
    assert_eq!(read_report(&cfg.output_csv).len(), 2);

    // Third run has nothing left to do.
    let third = run_pipeline(&cfg, &CancelFlag::new()).unwrap();
    assert_eq!(third.processed, 0);
    assert_eq!(read_report(&cfg.output_csv).len(), 2);
}

#[test]
fn test_retry_errors_replays_only_error_rows() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    write_supplier_csv(&dir.path().join("suppliers.csv"));
    let mut cfg = pipeline_config(dir.path(), &paths.db_path, "retry");

    // Seed the checkpoint: S1 succeeded, S2 failed.
    {
        let mut state = CheckpointStore::open(&cfg.checkpoint_path).unwrap();
        state
            .upsert_result(&MatchResult {
                input_id: "S1".into(),
                resolved_siret: Some(SIRET_NORD.into()),
                official_name: Some("DUPONT LOGISTIQUE NORD".into()),
                confidence_score: 1.0,
                match_method: MatchMethod::DirectId,
                alternatives: Vec::new(),
                debug: serde_json::Map::new(),
            })
            .unwrap();
        state.upsert_error("S2", "transient oracle failure").unwrap();
        state.commit().unwrap();
    }

    // Default mode skips error rows too.
    let outcome = run_pipeline(&cfg, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.processed, 0);

    // Retry mode replays exactly the error row and clears it.
    cfg.retry_errors = true;
    let outcome = run_pipeline(&cfg, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.processed, 1);

    let rows = read_report(&cfg.output_csv);
    let s2 = rows.iter().find(|r| r["input_id"] == "S2").unwrap();
    assert_eq!(s2["error"], "");
    assert_eq!(s2["match_method"], "NOT_FOUND");
}

#[test]
fn test_parallel_matches_sequential() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    write_supplier_csv(&dir.path().join("suppliers.csv"));

    let seq_cfg = pipeline_config(dir.path(), &paths.db_path, "p1");
    run_pipeline(&seq_cfg, &CancelFlag::new()).unwrap();

    let par_cfg = pipeline_config(dir.path(), &paths.db_path, "p2");
    let outcome = run_pipeline_parallel(&par_cfg, 2, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.processed, 2);

    let key = |rows: &[BTreeMap<String, String>]| -> Vec<(String, String, String)> {
        let mut keys: Vec<_> = rows
            .iter()
            .map(|r| {
                (
                    r["input_id"].clone(),
                    r["resolved_siret"].clone(),
                    r["match_method"].clone(),
                )
            })
            .collect();
        keys.sort();
        keys
    };
    assert_eq!(
        key(&read_report(&seq_cfg.output_csv)),
        key(&read_report(&par_cfg.output_csv))
    );
}

#[test]
fn test_cancelled_run_flushes_and_reports_interruption() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    write_supplier_csv(&dir.path().join("suppliers.csv"));
    let cfg = pipeline_config(dir.path(), &paths.db_path, "cancel");

    let cancel = CancelFlag::new();
    cancel.cancel();
    let outcome = run_pipeline(&cfg, &cancel).unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.processed, 0);
    // The report still exists and is well-formed.
    assert!(cfg.output_csv.exists());
    read_report(&cfg.output_csv);
}
