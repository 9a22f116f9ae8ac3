use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode};

use crate::matcher::MatchResult;

use super::{report, Result};

/// Attempts for lock-contended statements and commits.
const LOCK_RETRY_ATTEMPTS: u32 = 6;
/// Linear backoff step between attempts: 0.5s, 1.0s, 1.5s, ...
const LOCK_RETRY_STEP: Duration = Duration::from_millis(500);
/// How long SQLite itself waits on a busy lock before failing a statement.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// One durable record per input id. Exactly one of the result fields or
/// `error` is populated.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub input_id: String,
    pub resolved_siret: Option<String>,
    pub official_name: Option<String>,
    pub confidence_score: Option<f64>,
    pub match_method: Option<String>,
    pub alternatives_json: Option<String>,
    pub error: Option<String>,
}

impl CheckpointRow {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A write not yet durably committed, kept in memory so the open
/// transaction can be replayed when the store has to move.
#[derive(Debug, Clone)]
enum PendingWrite {
    Result(MatchResult),
    Error { input_id: String, error: String },
}

/// Crash-safe single-writer store of per-row outcomes, keyed by input id.
/// Written only by the pipeline driver; workers never touch it.
///
/// Lock contention is retried with backoff; when the retries are exhausted
/// the store relocates to a fresh file in the temp directory and replays
/// the pending writes there, so accumulated outcomes are never dropped.
pub struct CheckpointStore {
    conn: Connection,
    path: PathBuf,
    in_tx: bool,
    pending: Vec<PendingWrite>,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
            path: path.to_path_buf(),
            in_tx: false,
            pending: Vec::new(),
        })
    }

    /// Open the configured path, falling back to a fresh file in the system
    /// temp directory when the path is exclusively locked by someone else.
    pub fn open_or_fallback(path: &Path) -> Result<Self> {
        match Self::open(path) {
            Ok(store) => Ok(store),
            Err(super::PipelineError::CheckpointError(err)) if is_locked(&err) => {
                let fallback = fallback_path();
                tracing::warn!(
                    "checkpoint {} is locked, using temp store {}",
                    path.display(),
                    fallback.display()
                );
                Self::open(&fallback)
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ids with any entry when `include_errors`, else only successful ones.
    pub fn get_processed_ids(&self, include_errors: bool) -> Result<HashSet<String>> {
        let sql = if include_errors {
            "SELECT input_id FROM results"
        } else {
            "SELECT input_id FROM results WHERE error IS NULL"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// Record a success, clearing any previous error for the id.
    pub fn upsert_result(&mut self, result: &MatchResult) -> Result<()> {
        self.write(PendingWrite::Result(result.clone()))
    }

    /// Record an error. A success already stored for the id is preserved:
    /// error never overwrites success.
    pub fn upsert_error(&mut self, input_id: &str, error: &str) -> Result<()> {
        self.write(PendingWrite::Error {
            input_id: input_id.to_string(),
            error: error.to_string(),
        })
    }

    /// Flush everything written so far. After this returns, prior upserts
    /// survive a process crash. Contention that outlives the retry budget
    /// moves the store instead of failing the run.
    pub fn commit(&mut self) -> Result<()> {
        if !self.in_tx {
            return Ok(());
        }
        match self.try_commit() {
            Ok(()) => {
                self.pending.clear();
                Ok(())
            }
            Err(err) if is_locked(&err) => {
                self.relocate(&err)?;
                // The relocated store is a private temp file; a failure here
                // is not contention and propagates.
                self.try_commit()?;
                self.pending.clear();
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All rows, ordered by input id for a stable report.
    pub fn fetch_all(&self) -> Result<Vec<CheckpointRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT input_id, resolved_siret, official_name, confidence_score,
                    match_method, alternatives_json, error
             FROM results
             ORDER BY input_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CheckpointRow {
                input_id: row.get(0)?,
                resolved_siret: row.get(1)?,
                official_name: row.get(2)?,
                confidence_score: row.get(3)?,
                match_method: row.get(4)?,
                alternatives_json: row.get(5)?,
                error: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Write the unified report CSV for everything recorded so far.
    pub fn export(&self, output_csv: &Path) -> Result<()> {
        report::export_checkpoint(&self.fetch_all()?, output_csv)
    }

    /// Queue the write, then apply it. Exhausted lock retries relocate the
    /// store; the queue is what makes the replay possible.
    fn write(&mut self, entry: PendingWrite) -> Result<()> {
        self.pending.push(entry.clone());
        match self.apply(&entry) {
            Ok(()) => Ok(()),
            Err(err) if is_locked(&err) => self.relocate(&err),
            Err(err) => Err(err.into()),
        }
    }

    fn apply(&mut self, entry: &PendingWrite) -> rusqlite::Result<()> {
        self.begin_if_needed()?;
        match entry {
            PendingWrite::Result(result) => {
                execute_with_backoff(
                    &self.conn,
                    "INSERT INTO results
                       (input_id, resolved_siret, official_name, confidence_score,
                        match_method, alternatives_json, error, updated_at_epoch)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)
                     ON CONFLICT(input_id) DO UPDATE SET
                       resolved_siret = excluded.resolved_siret,
                       official_name = excluded.official_name,
                       confidence_score = excluded.confidence_score,
                       match_method = excluded.match_method,
                       alternatives_json = excluded.alternatives_json,
                       error = NULL,
                       updated_at_epoch = excluded.updated_at_epoch",
                    params![
                        result.input_id,
                        result.resolved_siret,
                        result.official_name,
                        result.confidence_score,
                        result.match_method.as_str(),
                        result.alternatives_json(),
                        chrono::Utc::now().timestamp(),
                    ],
                )?;
            }
            PendingWrite::Error { input_id, error } => {
                execute_with_backoff(
                    &self.conn,
                    "INSERT INTO results (input_id, error, updated_at_epoch)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(input_id) DO UPDATE SET
                       error = excluded.error,
                       updated_at_epoch = excluded.updated_at_epoch
                     WHERE results.error IS NOT NULL",
                    params![input_id, error, chrono::Utc::now().timestamp()],
                )?;
            }
        }
        Ok(())
    }

    fn begin_if_needed(&mut self) -> rusqlite::Result<()> {
        if !self.in_tx {
            execute_with_backoff(&self.conn, "BEGIN IMMEDIATE", params![])?;
            self.in_tx = true;
        }
        Ok(())
    }

    fn try_commit(&mut self) -> rusqlite::Result<()> {
        let mut attempt = 0;
        loop {
            match self.conn.execute_batch("COMMIT") {
                Ok(()) => {
                    self.in_tx = false;
                    return Ok(());
                }
                Err(err) if is_locked(&err) && attempt + 1 < LOCK_RETRY_ATTEMPTS => {
                    std::thread::sleep(LOCK_RETRY_STEP * (attempt + 1));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Move to a fresh store in the temp directory: carry over what the
    /// abandoned store already holds, then replay the uncommitted writes.
    fn relocate(&mut self, cause: &rusqlite::Error) -> Result<()> {
        let fallback = fallback_path();
        tracing::warn!(
            "checkpoint {} is contended ({cause}), relocating to {}",
            self.path.display(),
            fallback.display()
        );

        // Reads stay available on the old connection even while its writes
        // are blocked. If the snapshot fails only rows already committed to
        // the old path are left behind, never the queued outcomes.
        let snapshot = self.fetch_all().unwrap_or_else(|err| {
            tracing::warn!(
                "cannot carry over rows from {} ({err}); they remain there",
                self.path.display()
            );
            Vec::new()
        });

        self.conn = open_connection(&fallback)?;
        self.path = fallback;
        self.in_tx = false;

        for row in &snapshot {
            self.restore(row)?;
        }
        let pending = std::mem::take(&mut self.pending);
        for entry in &pending {
            self.apply(entry)?;
        }
        self.pending = pending;
        Ok(())
    }

    /// Re-insert a carried-over row verbatim, error column included.
    fn restore(&mut self, row: &CheckpointRow) -> rusqlite::Result<()> {
        self.begin_if_needed()?;
        execute_with_backoff(
            &self.conn,
            "INSERT INTO results
               (input_id, resolved_siret, official_name, confidence_score,
                match_method, alternatives_json, error, updated_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(input_id) DO UPDATE SET
               resolved_siret = excluded.resolved_siret,
               official_name = excluded.official_name,
               confidence_score = excluded.confidence_score,
               match_method = excluded.match_method,
               alternatives_json = excluded.alternatives_json,
               error = excluded.error,
               updated_at_epoch = excluded.updated_at_epoch",
            params![
                row.input_id,
                row.resolved_siret,
                row.official_name,
                row.confidence_score,
                row.match_method,
                row.alternatives_json,
                row.error,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        if self.in_tx {
            let _ = self.conn.execute_batch("COMMIT");
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // A competing process may hold the schema lock; WAL/synchronous are
    // best-effort in that case.
    for (pragma, value) in [("journal_mode", "WAL"), ("synchronous", "NORMAL")] {
        if let Err(err) = conn.pragma_update(None, pragma, value) {
            if !is_locked(&err) {
                return Err(err.into());
            }
        }
    }
    execute_with_backoff(
        &conn,
        "CREATE TABLE IF NOT EXISTS results (
           input_id TEXT PRIMARY KEY,
           resolved_siret TEXT,
           official_name TEXT,
           confidence_score REAL,
           match_method TEXT,
           alternatives_json TEXT,
           error TEXT,
           updated_at_epoch INTEGER
         )",
        params![],
    )?;
    execute_with_backoff(
        &conn,
        "CREATE INDEX IF NOT EXISTS idx_error ON results(error)",
        params![],
    )?;
    Ok(conn)
}

fn execute_with_backoff(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params + Clone,
) -> rusqlite::Result<usize> {
    let mut attempt = 0;
    loop {
        match conn.execute(sql, params.clone()) {
            Ok(n) => return Ok(n),
            Err(err) if is_locked(&err) && attempt + 1 < LOCK_RETRY_ATTEMPTS => {
                std::thread::sleep(LOCK_RETRY_STEP * (attempt + 1));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn fallback_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "sirene_state_{}_{}.sqlite",
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    ))
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}
