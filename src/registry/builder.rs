use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use rusqlite::{params, Connection};

use super::frames::{canonical_establishments, scan, str_at, write_parquet};
use super::{RegistryError, RegistryPaths, Result};

/// Build-time options for the one-time registry derivation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Use only the first N rows of each source archive. The company sample
    /// is filtered to the sirens present in the establishment sample so
    /// cross-references keep resolving.
    pub sample_rows: Option<usize>,
    /// Rebuild tables, samples and partitions even when they already exist.
    pub force_rebuild: bool,
}

/// Derives the analytical store from the two source archives:
/// the `companies_active` table, the FTS index on the denomination, the
/// establishment partition tree, and the metadata sidecar. Idempotent.
pub fn build_registry(paths: &RegistryPaths, opts: &BuildOptions) -> Result<()> {
    let started = std::time::Instant::now();
    let partitions_root = paths.partitions_root();
    fs::create_dir_all(&partitions_root)?;

    let (companies_parquet, establishments_parquet) = match opts.sample_rows {
        Some(n) => materialize_samples(paths, n, opts.force_rebuild)?,
        None => (
            paths.companies_parquet.clone(),
            paths.establishments_parquet.clone(),
        ),
    };

    let mut conn = Connection::open(&paths.db_path)?;
    build_companies_table(&mut conn, &companies_parquet)?;
    build_fts_index(&conn)?;
    build_partitions(
        &establishments_parquet,
        &partitions_root,
        opts.force_rebuild,
    )?;
    write_metadata(
        &conn,
        &companies_parquet,
        &establishments_parquet,
        &partitions_root,
        opts.sample_rows,
    )?;

    tracing::info!(
        "registry build complete in {:.1}s (db={})",
        started.elapsed().as_secs_f64(),
        paths.db_path.display()
    );
    Ok(())
}

/// Write bounded samples of both archives under `{partitions_dir}/_samples`.
/// The company sample keeps only sirens present in the establishment sample.
fn materialize_samples(
    paths: &RegistryPaths,
    sample_rows: usize,
    force_rebuild: bool,
) -> Result<(PathBuf, PathBuf)> {
    let sample_dir = paths.partitions_dir.join("_samples");
    fs::create_dir_all(&sample_dir)?;
    let establishments_sample = sample_dir.join("StockEtablissement_sample.parquet");
    let companies_sample = sample_dir.join("StockUniteLegale_sample.parquet");

    if force_rebuild || !establishments_sample.exists() {
        let mut df = scan(&paths.establishments_parquet)?
            .limit(sample_rows as IdxSize)
            .collect()?;
        write_parquet(&establishments_sample, &mut df)?;
        tracing::info!(
            "sampled {} establishment rows to {}",
            df.height(),
            establishments_sample.display()
        );
    }

    if force_rebuild || !companies_sample.exists() {
        let sirens_df = scan(&establishments_sample)?
            .select([col("siren").cast(DataType::String)])
            .collect()?;
        let mut sirens = HashSet::new();
        for i in 0..sirens_df.height() {
            let siren = str_at(&sirens_df, "siren", i)?;
            if !siren.is_empty() {
                sirens.insert(siren);
            }
        }
        let sirens = Series::new("siren".into(), sirens.into_iter().collect::<Vec<_>>());
        let mut df = scan(&paths.companies_parquet)?
            .filter(
                col("siren")
                    .cast(DataType::String)
                    .is_in(lit(sirens), false),
            )
            .collect()?;
        write_parquet(&companies_sample, &mut df)?;
        tracing::info!(
            "sampled {} company rows to {}",
            df.height(),
            companies_sample.display()
        );
    }

    Ok((companies_sample, establishments_sample))
}

/// `companies_active`: active rows with a non-blank denomination, uppercased.
fn build_companies_table(conn: &mut Connection, companies_parquet: &Path) -> Result<()> {
    let df = scan(companies_parquet)?
        .filter(
            col("etatAdministratifUniteLegale")
                .eq(lit("A"))
                .and(col("denominationUniteLegale").is_not_null())
                .and(
                    col("denominationUniteLegale")
                        .str()
                        .strip_chars(lit(NULL))
                        .str()
                        .len_chars()
                        .gt(lit(0)),
                ),
        )
        .select([
            col("siren").cast(DataType::String),
            col("denominationUniteLegale")
                .str()
                .to_uppercase()
                .alias("denomination"),
            col("activitePrincipaleUniteLegale")
                .cast(DataType::String)
                .alias("principal_activity"),
            col("etatAdministratifUniteLegale").alias("administrative_state"),
        ])
        .collect()?;

    conn.execute_batch(
        "DROP TABLE IF EXISTS companies_active;
         CREATE TABLE companies_active (
           id INTEGER PRIMARY KEY,
           siren TEXT NOT NULL,
           denomination TEXT NOT NULL,
           principal_activity TEXT,
           administrative_state TEXT NOT NULL
         );
         CREATE INDEX idx_companies_active_siren ON companies_active(siren);",
    )?;

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO companies_active
               (siren, denomination, principal_activity, administrative_state)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for i in 0..df.height() {
            let activity = str_at(&df, "principal_activity", i)?;
            stmt.execute(params![
                str_at(&df, "siren", i)?,
                str_at(&df, "denomination", i)?,
                if activity.is_empty() { None } else { Some(activity) },
                str_at(&df, "administrative_state", i)?,
            ])?;
        }
    }
    tx.commit()?;
    tracing::info!("companies_active: {} rows", df.height());
    Ok(())
}

fn build_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS companies_fts;
         CREATE VIRTUAL TABLE companies_fts
           USING fts5(denomination, content='companies_active', content_rowid='id');
         INSERT INTO companies_fts(companies_fts) VALUES('rebuild');",
    )?;
    Ok(())
}

/// Emit `region_prefix=XX/part-0.parquet` files for every two-digit postal
/// prefix, active establishments only. Skipped when partitions already exist
/// and `force_rebuild` is off.
fn build_partitions(
    establishments_parquet: &Path,
    partitions_root: &Path,
    force_rebuild: bool,
) -> Result<()> {
    let existing = partition_dirs(partitions_root)?;
    if !existing.is_empty() {
        if !force_rebuild {
            tracing::info!(
                "partitions already present under {} ({} prefixes), skipping",
                partitions_root.display(),
                existing.len()
            );
            return Ok(());
        }
        for dir in existing {
            fs::remove_dir_all(dir)?;
        }
    }

    let lf = canonical_establishments(scan(establishments_parquet)?)
        .filter(col("region_prefix").str().contains(lit("^[0-9]{2}$"), false));

    let prefix_df = lf.clone().select([col("region_prefix")]).collect()?;
    let mut prefixes = HashSet::new();
    for i in 0..prefix_df.height() {
        prefixes.insert(str_at(&prefix_df, "region_prefix", i)?);
    }
    let mut prefixes: Vec<String> = prefixes.into_iter().collect();
    prefixes.sort();

    let mut total_rows = 0usize;
    for prefix in &prefixes {
        let mut part = lf
            .clone()
            .filter(col("region_prefix").eq(lit(prefix.as_str())))
            .collect()?;
        let dir = partitions_root.join(format!("region_prefix={prefix}"));
        fs::create_dir_all(&dir)?;
        write_parquet(&dir.join("part-0.parquet"), &mut part)?;
        total_rows += part.height();
        tracing::debug!("partition region_prefix={}: {} rows", prefix, part.height());
    }
    tracing::info!(
        "partition tree: {} prefixes, {} establishments",
        prefixes.len(),
        total_rows
    );
    Ok(())
}

fn partition_dirs(partitions_root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !partitions_root.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(partitions_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() && name.starts_with("region_prefix=") {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn write_metadata(
    conn: &Connection,
    companies_parquet: &Path,
    establishments_parquet: &Path,
    partitions_root: &Path,
    sample_rows: Option<usize>,
) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT);",
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )?;
    let entries = [
        ("companies_parquet", absolute(companies_parquet)?),
        ("establishments_parquet", absolute(establishments_parquet)?),
        ("partitions_root", absolute(partitions_root)?),
        (
            "created_at_epoch",
            chrono::Utc::now().timestamp().to_string(),
        ),
        (
            "sample_rows",
            sample_rows.map(|n| n.to_string()).unwrap_or_default(),
        ),
    ];
    for (key, value) in entries {
        stmt.execute(params![key, value])?;
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<String> {
    let canonical = fs::canonicalize(path).map_err(|e| {
        RegistryError::InvalidData(format!("cannot resolve {}: {e}", path.display()))
    })?;
    Ok(canonical.to_string_lossy().to_string())
}
