//! The unified report schema shared by the registry matcher and the
//! web-search branch, and the writers that produce it.

use std::collections::HashMap;
use std::path::Path;

use super::checkpoint::CheckpointRow;
use super::Result;

/// Exact column order of every report this tool emits.
pub const REPORT_COLUMNS: [&str; 15] = [
    "input_id",
    "resolved_siret",
    "official_name",
    "confidence_score",
    "match_method",
    "alternatives",
    "found_website",
    "found_address",
    "found_phone",
    "found_email",
    "country",
    "city",
    "postal_code",
    "search_method",
    "error",
];

/// One report line; absent values are empty strings.
#[derive(Debug, Clone, Default)]
pub struct ReportRow {
    pub input_id: String,
    pub resolved_siret: String,
    pub official_name: String,
    pub confidence_score: String,
    pub match_method: String,
    pub alternatives: String,
    pub found_website: String,
    pub found_address: String,
    pub found_phone: String,
    pub found_email: String,
    pub country: String,
    pub city: String,
    pub postal_code: String,
    pub search_method: String,
    pub error: String,
}

impl ReportRow {
    fn record(&self) -> [&str; 15] {
        [
            &self.input_id,
            &self.resolved_siret,
            &self.official_name,
            &self.confidence_score,
            &self.match_method,
            &self.alternatives,
            &self.found_website,
            &self.found_address,
            &self.found_phone,
            &self.found_email,
            &self.country,
            &self.city,
            &self.postal_code,
            &self.search_method,
            &self.error,
        ]
    }
}

pub fn write_report(rows: &[ReportRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(REPORT_COLUMNS)?;
    for row in rows {
        writer.write_record(row.record())?;
    }
    writer.flush()?;
    Ok(())
}

/// Checkpoint rows → report rows. Error entries keep their id, carry the
/// error text, and are labeled with the `ERROR` method.
pub(super) fn export_checkpoint(rows: &[CheckpointRow], path: &Path) -> Result<()> {
    let report: Vec<ReportRow> = rows.iter().map(checkpoint_to_report).collect();
    write_report(&report, path)?;
    tracing::info!("exported {} rows to {}", report.len(), path.display());
    Ok(())
}

fn checkpoint_to_report(row: &CheckpointRow) -> ReportRow {
    ReportRow {
        input_id: row.input_id.clone(),
        resolved_siret: row.resolved_siret.clone().unwrap_or_default(),
        official_name: row.official_name.clone().unwrap_or_default(),
        // Debug float formatting keeps a trailing .0 on whole confidences.
        confidence_score: row
            .confidence_score
            .map(|c| format!("{c:?}"))
            .unwrap_or_default(),
        match_method: row
            .match_method
            .clone()
            .unwrap_or_else(|| if row.is_error() { "ERROR".into() } else { String::new() }),
        alternatives: row.alternatives_json.clone().unwrap_or_default(),
        error: row.error.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Merge several unified-schema CSVs into one, ordered by input id; inputs
/// that do not exist are skipped. Columns are matched by name so
/// partially-filled files merge cleanly. Returns the number of rows written.
pub fn combine_reports(inputs: &[&Path], output: &Path) -> Result<usize> {
    let mut combined: Vec<ReportRow> = Vec::new();
    for input in inputs {
        if !input.exists() {
            continue;
        }
        let mut reader = csv::Reader::from_path(input)?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let index: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();
        let mut loaded = 0usize;
        for record in reader.records() {
            let record = record?;
            let field = |name: &str| -> String {
                index
                    .get(name)
                    .and_then(|&i| record.get(i))
                    .unwrap_or_default()
                    .to_string()
            };
            combined.push(ReportRow {
                input_id: field("input_id"),
                resolved_siret: field("resolved_siret"),
                official_name: field("official_name"),
                confidence_score: field("confidence_score"),
                match_method: field("match_method"),
                alternatives: field("alternatives"),
                found_website: field("found_website"),
                found_address: field("found_address"),
                found_phone: field("found_phone"),
                found_email: field("found_email"),
                country: field("country"),
                city: field("city"),
                postal_code: field("postal_code"),
                search_method: field("search_method"),
                error: field("error"),
            });
            loaded += 1;
        }
        tracing::info!("combined {} rows from {}", loaded, input.display());
    }
    combined.sort_by(|a, b| a.input_id.cmp(&b.input_id));
    write_report(&combined, output)?;
    Ok(combined.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_to_report_success() {
        let row = CheckpointRow {
            input_id: "S1".into(),
            resolved_siret: Some("11111111100011".into()),
            official_name: Some("ACME".into()),
            confidence_score: Some(1.0),
            match_method: Some("DIRECT_ID".into()),
            alternatives_json: Some("[]".into()),
            error: None,
        };
        let report = checkpoint_to_report(&row);
        assert_eq!(report.confidence_score, "1.0");
        assert_eq!(report.match_method, "DIRECT_ID");
        assert_eq!(report.error, "");
        assert_eq!(report.found_website, "");
    }

    #[test]
    fn test_checkpoint_to_report_error() {
        let row = CheckpointRow {
            input_id: "S2".into(),
            resolved_siret: None,
            official_name: None,
            confidence_score: None,
            match_method: None,
            alternatives_json: None,
            error: Some("oracle exploded".into()),
        };
        let report = checkpoint_to_report(&row);
        assert_eq!(report.match_method, "ERROR");
        assert_eq!(report.error, "oracle exploded");
        assert_eq!(report.resolved_siret, "");
    }

    #[test]
    fn test_combine_reports_orders_by_input_id() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("domestic.csv");
        let second = dir.path().join("foreign.csv");
        let combined = dir.path().join("combined.csv");

        let row = |id: &str| ReportRow {
            input_id: id.to_string(),
            ..Default::default()
        };
        write_report(&[row("S3"), row("S1")], &first).unwrap();
        write_report(&[row("S2")], &second).unwrap();

        let written =
            combine_reports(&[first.as_path(), second.as_path()], &combined).unwrap();
        assert_eq!(written, 3);

        let mut reader = csv::Reader::from_path(&combined).unwrap();
        let ids: Vec<String> = reader
            .records()
            .map(|r| r.unwrap().get(0).unwrap().to_string())
            .collect();
        assert_eq!(ids, ["S1", "S2", "S3"]);
    }

    #[test]
    fn test_write_report_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_report(&[ReportRow::default()], &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, REPORT_COLUMNS);
    }
}
