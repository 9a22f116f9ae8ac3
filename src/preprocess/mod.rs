//! Ingest glue: identify the logical columns of a messy supplier table,
//! infer a country for every row, drop inactive suppliers, and split the
//! table into a domestic group (registry matching) and a non-domestic group
//! (web search).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::matcher::text::{digits_only, normalize};
use crate::pipeline::{load_supplier_table, SupplierRow, SupplierTable};

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("input error: {0}")]
    InputError(#[from] crate::pipeline::PipelineError),

    #[error("missing required columns: {0:?}")]
    MissingColumns(Vec<&'static str>),
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

lazy_static! {
    static ref FIVE_DIGITS: Regex = Regex::new(r"^[0-9]{5}$").unwrap();

    /// Large French communes, uppercase. Enough coverage to classify the
    /// common cases; the indicator patterns below catch the long tail.
    static ref FRENCH_CITIES: HashSet<&'static str> = [
        "PARIS", "LYON", "MARSEILLE", "TOULOUSE", "NICE", "NANTES", "STRASBOURG",
        "MONTPELLIER", "BORDEAUX", "LILLE", "RENNES", "REIMS", "SAINT-ETIENNE",
        "TOULON", "LE HAVRE", "GRENOBLE", "DIJON", "ANGERS", "NIMES", "VILLEURBANNE",
        "SAINT-DENIS", "LE MANS", "AIX-EN-PROVENCE", "CLERMONT-FERRAND", "BREST",
        "LIMOGES", "TOURS", "AMIENS", "PERPIGNAN", "METZ", "BESANCON",
        "BOULOGNE-BILLANCOURT", "ORLEANS", "MULHOUSE", "ROUEN", "CAEN", "NANCY",
        "ARGENTEUIL", "ROUBAIX", "TOURCOING", "NANTERRE", "AVIGNON", "CRETEIL",
        "DUNKERQUE", "POITIERS", "ASNIERES-SUR-SEINE", "COURBEVOIE", "VERSAILLES",
        "VITRY-SUR-SEINE", "COLOMBES", "AULNAY-SOUS-BOIS", "RUEIL-MALMAISON",
        "ANTIBES", "CANNES", "BOURGES", "MERIGNAC", "SAINT-NAZAIRE",
        "ISSY-LES-MOULINEAUX", "NOISY-LE-GRAND", "EVRY", "CHAMPIGNY-SUR-MARNE",
        "LEVALLOIS-PERRET", "ANTONY", "CLICHY", "IVRY-SUR-SEINE", "NEUILLY-SUR-SEINE",
        "PANTIN", "LA ROCHELLE", "SAINT-OUEN", "CHAMBERY", "AUXERRE", "SETE",
        "BAYONNE", "CHARTRES", "VALENCE", "ARRAS", "BOULOGNE-SUR-MER", "CALAIS",
        "SAINT-BRIEUC", "ALBI", "MEAUX", "RODEZ", "AGEN", "TARBES", "PAU",
        "PERIGUEUX", "CHATEAUROUX", "BLOIS", "MELUN", "FONTAINEBLEAU", "VINCENNES",
    ]
    .into_iter()
    .collect();

    /// Cities that look French to the pattern rules but are not.
    static ref NON_FRENCH_CITIES: HashSet<&'static str> = [
        "LA PAZ", "LAS VEGAS", "LOS ANGELES", "LA HABANA", "LA PLATA",
        "SANTA FE", "SANTA CRUZ", "SAN JOSE", "SAN FRANCISCO",
    ]
    .into_iter()
    .collect();

    static ref FRENCH_COUNTRY_NAMES: HashSet<&'static str> = [
        "FRANCE", "FR", "FRA", "FRANCAIS", "FRANCAISE", "FRANÇAIS", "FRANÇAISE",
        "FRENCH", "FRANCE METROPOLITAINE", "METROPOLE", "METROPOLITAIN",
    ]
    .into_iter()
    .collect();
}

/// Toponym fragments typical of French commune names.
const FRENCH_INDICATORS: [&str; 16] = [
    "SAINT-", "SAINTE-", "LES ", "DU ", "DE LA ", "DES ", "SUR ", "SOUS ",
    "EN ", "ET ", "L'", "D'", "AUX ", "AU ", "LE HAVRE", "LA ROCHELLE",
];

/// Actual header names behind the logical columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    pub nom: Option<String>,
    pub postal: Option<String>,
    pub ville: Option<String>,
    pub pays: Option<String>,
    pub siret: Option<String>,
    pub last_movement: Option<String>,
}

/// Map logical column names to the headers actually present, via a fixed
/// alias table.
pub fn identify_columns(headers: &[String]) -> ColumnMap {
    let upper: Vec<(String, &String)> = headers
        .iter()
        .map(|h| (h.trim().to_uppercase(), h))
        .collect();
    let find = |aliases: &[&str]| -> Option<String> {
        for alias in aliases {
            if let Some((_, original)) = upper.iter().find(|(u, _)| u == alias) {
                return Some((*original).clone());
            }
        }
        None
    };
    ColumnMap {
        nom: find(&[
            "NOM",
            "NAME",
            "NOM FOURNISSEUR",
            "SUPPLIER NAME",
            "COMPANY NAME",
            "RAISON SOCIALE",
        ]),
        postal: find(&[
            "POSTAL",
            "CODE POSTAL",
            "CP",
            "ZIP",
            "ZIP CODE",
            "POSTCODE",
            "POSTAL CODE",
        ]),
        ville: find(&["VILLE", "CITY", "COMMUNE", "LOCALITE"]),
        pays: find(&["PAYS", "COUNTRY", "PAYS FOURNISSEUR", "COUNTRY CODE"]),
        siret: find(&["CODE SIRET", "SIRET", "SIREN", "CODE SIREN"]),
        last_movement: find(&[
            "DATE DERN. MOUVT",
            "DATE DERNIER MOUVEMENT",
            "LAST MOVEMENT DATE",
            "DATE DERN MOUVT",
            "DERNIER MOUVEMENT",
            "LAST MOVEMENT",
        ]),
    }
}

/// Five digits after repairing spreadsheet damage (trailing `.0`, dropped
/// leading zeros).
pub fn is_french_postal(postal: &str) -> bool {
    let mut postal = postal.trim().to_string();
    if postal.is_empty() {
        return false;
    }
    if let Some(stripped) = postal.split('.').next() {
        postal = stripped.trim().to_string();
    }
    if postal.len() < 5 && postal.chars().all(|c| c.is_ascii_digit()) {
        postal = format!("{postal:0>5}");
    }
    FIVE_DIGITS.is_match(&postal)
}

pub fn is_french_city(city: &str) -> bool {
    let city = normalize(city);
    if city.is_empty() || NON_FRENCH_CITIES.contains(city.as_str()) {
        return false;
    }
    if FRENCH_CITIES.contains(city.as_str()) {
        return true;
    }
    if FRENCH_INDICATORS.iter().any(|ind| city.contains(ind)) {
        return true;
    }
    // Bare "LE X" / "LA X" is weaker evidence; the obvious impostors were
    // already rejected above.
    (city.starts_with("LE ") || city.starts_with("LA ")) && city.len() > 5
}

/// Country of a row, in priority order: a plausible registry id, the country
/// column, a recognizably French city, a five-digit postal code.
pub fn infer_country(row: &SupplierRow, columns: &ColumnMap) -> String {
    if let Some(col) = &columns.siret {
        if digits_only(&row.text(col)).len() >= 9 {
            return "FRANCE".to_string();
        }
    }

    if let Some(col) = &columns.pays {
        let pays = normalize(&row.text(col));
        if !pays.is_empty() {
            if FRENCH_COUNTRY_NAMES.contains(pays.as_str()) || pays.starts_with("FR") {
                return "FRANCE".to_string();
            }
            return if pays.len() > 1 {
                pays
            } else {
                "UNKNOWN".to_string()
            };
        }
    }

    if let Some(col) = &columns.ville {
        if is_french_city(&row.text(col)) {
            return "FRANCE".to_string();
        }
    }

    if let Some(col) = &columns.postal {
        if is_french_postal(&row.text(col)) {
            return "FRANCE".to_string();
        }
    }

    "UNKNOWN".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct PreprocessStats {
    pub total_original: usize,
    pub filtered_inactive: usize,
    pub french_suppliers: usize,
    pub non_french_suppliers: usize,
}

impl PreprocessStats {
    pub fn total_processed(&self) -> usize {
        self.french_suppliers + self.non_french_suppliers
    }
}

/// Split the input into domestic and non-domestic CSVs under `output_dir`,
/// preserving the original columns. Suppliers without a last-movement date
/// are dropped when `filter_inactive` is set and the column exists.
pub fn preprocess_suppliers(
    input: &Path,
    output_dir: &Path,
    filter_inactive: bool,
    limit_rows: Option<usize>,
) -> Result<(PathBuf, PathBuf, PreprocessStats)> {
    let table = load_supplier_table(input, limit_rows)?;
    let columns = identify_columns(&table.headers);
    tracing::info!("column mapping: {columns:?}");

    let mut missing = Vec::new();
    if columns.nom.is_none() {
        missing.push("Nom");
    }
    if columns.postal.is_none() {
        missing.push("Postal");
    }
    if columns.ville.is_none() {
        missing.push("Ville");
    }
    if !missing.is_empty() {
        return Err(PreprocessError::MissingColumns(missing));
    }

    let mut stats = PreprocessStats {
        total_original: table.rows.len(),
        ..Default::default()
    };

    let mut french = Vec::new();
    let mut non_french = Vec::new();
    for row in &table.rows {
        if filter_inactive {
            if let Some(col) = &columns.last_movement {
                if row.text(col).trim().is_empty() {
                    stats.filtered_inactive += 1;
                    continue;
                }
            }
        }
        if infer_country(row, &columns) == "FRANCE" {
            french.push(row);
        } else {
            non_french.push(row);
        }
    }
    stats.french_suppliers = french.len();
    stats.non_french_suppliers = non_french.len();

    fs::create_dir_all(output_dir)?;
    let french_path = output_dir.join("suppliers_french.csv");
    let non_french_path = output_dir.join("suppliers_non_french.csv");
    write_split(&french_path, &table, &french)?;
    write_split(&non_french_path, &table, &non_french)?;

    tracing::info!(
        "preprocessed {} suppliers: {} french, {} non-french, {} inactive dropped",
        stats.total_original,
        stats.french_suppliers,
        stats.non_french_suppliers,
        stats.filtered_inactive
    );
    Ok((french_path, non_french_path, stats))
}

fn write_split(path: &Path, table: &SupplierTable, rows: &[&SupplierRow]) -> Result<()> {
    let headers: Vec<&String> = table.headers.iter().filter(|h| !h.is_empty()).collect();
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&headers)?;
    for row in rows {
        let record: Vec<String> = headers.iter().map(|h| row.text(h)).collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Scalar;

    #[test]
    fn test_identify_columns_aliases() {
        let headers = vec![
            "Code tiers".to_string(),
            "Raison Sociale".to_string(),
            "CP".to_string(),
            "Commune".to_string(),
            "Country".to_string(),
        ];
        let columns = identify_columns(&headers);
        assert_eq!(columns.nom.as_deref(), Some("Raison Sociale"));
        assert_eq!(columns.postal.as_deref(), Some("CP"));
        assert_eq!(columns.ville.as_deref(), Some("Commune"));
        assert_eq!(columns.pays.as_deref(), Some("Country"));
        assert_eq!(columns.siret, None);
    }

    #[test]
    fn test_is_french_postal_repairs_damage() {
        assert!(is_french_postal("75001"));
        assert!(is_french_postal("75001.0"));
        assert!(is_french_postal("6000"));
        assert!(is_french_postal("97400"));
        assert!(!is_french_postal("SW1A 1AA"));
        assert!(!is_french_postal(""));
    }

    #[test]
    fn test_is_french_city() {
        assert!(is_french_city("Paris"));
        assert!(is_french_city("SAINT-MALO"));
        assert!(is_french_city("LE TOUQUET"));
        assert!(!is_french_city("LA PAZ"));
        assert!(!is_french_city("BERLIN"));
    }

    fn row(fields: &[(&str, &str)]) -> SupplierRow {
        let mut row = SupplierRow::new();
        for (key, value) in fields {
            row.insert(*key, Scalar::Text((*value).into()));
        }
        row
    }

    fn columns() -> ColumnMap {
        ColumnMap {
            nom: Some("Nom".into()),
            postal: Some("Postal".into()),
            ville: Some("Ville".into()),
            pays: Some("Pays".into()),
            siret: Some("Code SIRET".into()),
            last_movement: None,
        }
    }

    #[test]
    fn test_infer_country_priority() {
        // A registry id wins over everything else.
        let r = row(&[("Code SIRET", "12345678900014"), ("Pays", "GERMANY")]);
        assert_eq!(infer_country(&r, &columns()), "FRANCE");

        // Country column next.
        let r = row(&[("Pays", "fra")]);
        assert_eq!(infer_country(&r, &columns()), "FRANCE");
        let r = row(&[("Pays", "ITALIA")]);
        assert_eq!(infer_country(&r, &columns()), "ITALIA");

        // Then city, then postal.
        let r = row(&[("Ville", "Lyon")]);
        assert_eq!(infer_country(&r, &columns()), "FRANCE");
        let r = row(&[("Ville", "Springfield"), ("Postal", "75001")]);
        assert_eq!(infer_country(&r, &columns()), "FRANCE");

        let r = row(&[("Ville", "Springfield"), ("Postal", "IL 62704")]);
        assert_eq!(infer_country(&r, &columns()), "UNKNOWN");
    }
}
