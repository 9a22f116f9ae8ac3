use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use rusqlite::{Connection, OpenFlags};

use super::frames::{canonical_establishments, establishments_from, scan};
use super::model::{Establishment, FtsCandidate};
use super::{RegistryError, Result, STRICT_NAME_DISTANCE};

/// Read-only handle to the analytical store. Each worker opens its own.
///
/// The query surface is deliberately narrow: four operations, all
/// parameterized, so the storage engine stays an implementation detail.
pub struct RegistryStore {
    conn: Connection,
    establishments_parquet: PathBuf,
    partitions_root: PathBuf,
}

impl RegistryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            return Err(RegistryError::DatabaseNotFound(
                db_path.display().to_string(),
            ));
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "PRAGMA mmap_size = 268435456;
             PRAGMA cache_size = -65536;
             PRAGMA query_only = ON;",
        )?;

        let establishments_parquet = PathBuf::from(meta_value(&conn, "establishments_parquet")?);
        let partitions_root = PathBuf::from(meta_value(&conn, "partitions_root")?);
        Ok(Self {
            conn,
            establishments_parquet,
            partitions_root,
        })
    }

    /// Exact lookup by 14-digit establishment identifier against the full
    /// archive. Active rows only; denomination joined when the owning
    /// company is active.
    pub fn direct_lookup(&self, siret: &str) -> Result<Option<Establishment>> {
        let df = canonical_establishments(scan(&self.establishments_parquet)?)
            .filter(col("siret").eq(lit(siret)))
            .limit(1)
            .collect()?;
        let mut hits = establishments_from(&df)?;
        let Some(mut hit) = hits.pop() else {
            return Ok(None);
        };
        let names = self.denominations_for([hit.siren.as_str()].into_iter())?;
        hit.official_name = names.get(&hit.siren).cloned();
        Ok(Some(hit))
    }

    /// Establishments in the supplier's exact postal code whose company
    /// denomination is within a small edit distance of the cleaned name.
    pub fn strict_local_lookup(
        &self,
        postal: &str,
        clean_name: &str,
    ) -> Result<Vec<Establishment>> {
        if postal.len() < 2 {
            return Ok(Vec::new());
        }
        let Some(glob) = self.partition_glob(&postal[..2]) else {
            return Ok(Vec::new());
        };
        let df = scan(&glob)?
            .filter(col("codePostalEtablissement").eq(lit(postal)))
            .collect()?;
        let candidates = establishments_from(&df)?;
        let names = self.denominations_for(candidates.iter().map(|e| e.siren.as_str()))?;

        let mut out = Vec::new();
        for mut est in candidates {
            let Some(denomination) = names.get(&est.siren) else {
                continue;
            };
            if strsim::levenshtein(denomination, clean_name) <= STRICT_NAME_DISTANCE {
                est.official_name = Some(denomination.clone());
                out.push(est);
            }
        }
        Ok(out)
    }

    /// Ranked full-text candidates on the company denomination.
    /// BM25 convention: lower score is a better match.
    pub fn fts_candidates(&self, token: &str, limit: usize) -> Result<Vec<FtsCandidate>> {
        if token.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query = fts_quote(token);
        let mut stmt = self.conn.prepare(
            "SELECT c.siren, c.denomination, bm25(companies_fts) AS score
             FROM companies_fts
             JOIN companies_active c ON c.id = companies_fts.rowid
             WHERE companies_fts MATCH ?1
             ORDER BY score
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![query, limit as i64], |row| {
            Ok(FtsCandidate {
                siren: row.get(0)?,
                denomination: row.get(1)?,
                score: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Establishments of the given companies, either inside one region
    /// partition or - when no prefix is known - across the whole archive.
    pub fn fetch_by_sirens(
        &self,
        region_prefix: Option<&str>,
        sirens: &[String],
    ) -> Result<Vec<Establishment>> {
        if sirens.is_empty() {
            return Ok(Vec::new());
        }
        let filter_series = Series::new("sirens".into(), sirens.to_vec());
        let lf = match region_prefix {
            Some(prefix) => {
                let Some(glob) = self.partition_glob(prefix) else {
                    return Ok(Vec::new());
                };
                scan(&glob)?
            }
            None => canonical_establishments(scan(&self.establishments_parquet)?),
        };
        let df = lf
            .filter(col("siren").is_in(lit(filter_series), false))
            .collect()?;
        let candidates = establishments_from(&df)?;
        let names = self.denominations_for(candidates.iter().map(|e| e.siren.as_str()))?;

        let mut out = Vec::new();
        for mut est in candidates {
            let Some(denomination) = names.get(&est.siren) else {
                continue;
            };
            est.official_name = Some(denomination.clone());
            out.push(est);
        }
        Ok(out)
    }

    /// Denominations of active companies for a set of sirens.
    fn denominations_for<'a>(
        &self,
        sirens: impl Iterator<Item = &'a str>,
    ) -> Result<HashMap<String, String>> {
        let unique: HashSet<&str> = sirens.filter(|s| !s.is_empty()).collect();
        let mut out = HashMap::with_capacity(unique.len());
        let unique: Vec<&str> = unique.into_iter().collect();
        for chunk in unique.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT siren, denomination FROM companies_active WHERE siren IN ({placeholders})"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (siren, denomination) = row?;
                out.insert(siren, denomination);
            }
        }
        Ok(out)
    }

    /// Glob over one region partition, or None when the prefix has no
    /// partition directory (no active establishment carries it).
    fn partition_glob(&self, prefix: &str) -> Option<PathBuf> {
        let dir = self.partitions_root.join(format!("region_prefix={prefix}"));
        if dir.is_dir() {
            Some(dir.join("*.parquet"))
        } else {
            None
        }
    }
}

fn meta_value(conn: &Connection, key: &str) -> Result<String> {
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
    let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(value) => Ok(value?),
        None => Err(RegistryError::MissingMetadata(key.to_string())),
    }
}

/// Quote a token as a single FTS5 string so punctuation cannot be taken
/// for query syntax; embedded quotes are doubled.
fn fts_quote(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_quote() {
        assert_eq!(fts_quote("CARREFOUR"), "\"CARREFOUR\"");
        assert_eq!(fts_quote("A\"B"), "\"A\"\"B\"");
    }
}
