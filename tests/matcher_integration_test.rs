//! End-to-end matcher scenarios against a miniature registry.

mod common;

use common::{
    build_fixture_registry, SIRET_CLOSED_COMPANY, SIRET_INACTIVE, SIRET_MARTIN, SIRET_NORD,
    SIRET_SUD,
};
use sirene_rs::matcher::{match_supplier_row, MatchMethod};
use sirene_rs::oracle::OfflineOracle;
use sirene_rs::pipeline::{Scalar, SupplierRow};
use sirene_rs::registry::RegistryStore;
use tempfile::TempDir;

fn supplier(fields: &[(&str, &str)]) -> SupplierRow {
    let mut row = SupplierRow::new();
    for (key, value) in fields {
        row.insert(*key, Scalar::Text((*value).into()));
    }
    row.set_index(0);
    row
}

#[test]
fn test_direct_id_hit() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    let raw = supplier(&[
        ("Auxiliaire", "S1"),
        ("Nom", "ACME"),
        ("Postal", "75001"),
        ("Ville", "PARIS"),
        ("Code SIRET", SIRET_NORD),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_eq!(result.match_method, MatchMethod::DirectId);
    assert_eq!(result.resolved_siret.as_deref(), Some(SIRET_NORD));
    assert_eq!(result.official_name.as_deref(), Some("DUPONT LOGISTIQUE NORD"));
    assert_eq!(result.confidence_score, 1.0);
    assert!(result.alternatives.is_empty());
}

#[test]
fn test_direct_id_ignores_inactive_establishment() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    // The identifier exists but its establishment is closed; the matcher
    // must fall through to the search path and land on the active site.
    let raw = supplier(&[
        ("Auxiliaire", "S1"),
        ("Nom", "Dupont Logistique Nord"),
        ("Adresse 1", "10 RUE DE LA PAIX"),
        ("Postal", "75001"),
        ("Ville", "Paris"),
        ("Code SIRET", SIRET_INACTIVE),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_ne!(result.match_method, MatchMethod::DirectId);
    assert_ne!(result.resolved_siret.as_deref(), Some(SIRET_INACTIVE));
    assert_eq!(result.resolved_siret.as_deref(), Some(SIRET_NORD));
}

#[test]
fn test_strict_local_unique_hit() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    let raw = supplier(&[
        ("Auxiliaire", "S3"),
        ("Nom", "Martin Freres SARL"),
        ("Postal", "69001"),
        ("Ville", "Lyon"),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_eq!(result.match_method, MatchMethod::StrictLocal);
    assert_eq!(result.resolved_siret.as_deref(), Some(SIRET_MARTIN));
    assert_eq!(result.confidence_score, 0.95);
}

#[test]
fn test_unknown_supplier_is_not_found() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    let raw = supplier(&[
        ("Auxiliaire", "S2"),
        ("Nom", "SOCIETE INEXISTANTE XYZ QQQ"),
        ("Postal", "75001"),
        ("Ville", "PARIS"),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_eq!(result.match_method, MatchMethod::NotFound);
    assert_eq!(result.resolved_siret, None);
    assert_eq!(result.confidence_score, 0.0);
}

#[test]
fn test_no_location_short_circuits() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    let raw = supplier(&[
        ("Auxiliaire", "S4"),
        ("Nom", "ANY"),
        ("Postal", ""),
        ("Ville", ""),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_eq!(result.match_method, MatchMethod::NotFound);
    assert_eq!(result.confidence_score, 0.0);
    assert_eq!(
        result.debug.get("step").and_then(|v| v.as_str()),
        Some("NO_LOCATION")
    );
}

#[test]
fn test_city_only_searches_nationwide() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    let raw = supplier(&[
        ("Auxiliaire", "S5"),
        ("Nom", "Dupont Logistique Nord"),
        ("Adresse 1", "10 RUE DE LA PAIX"),
        ("Postal", ""),
        ("Ville", "Paris"),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_eq!(
        result.debug.get("search_scope").and_then(|v| v.as_str()),
        Some("nationwide")
    );
    assert_ne!(
        result.debug.get("step").and_then(|v| v.as_str()),
        Some("NO_LOCATION")
    );
    assert_eq!(result.match_method, MatchMethod::Calculated);
    assert_eq!(result.resolved_siret.as_deref(), Some(SIRET_NORD));
}

#[test]
fn test_near_tie_goes_to_arbiter() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    // Neither denomination is close enough for the name points, both cities
    // match, both addresses pass the similarity gate: a 50/50 tie.
    let raw = supplier(&[
        ("Auxiliaire", "S6"),
        ("Nom", "Dupont Logistique SAS"),
        ("Adresse 1", "10 RUE DE LA PAIX"),
        ("Postal", "75001"),
        ("Ville", "Paris"),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();

    assert_eq!(result.match_method, MatchMethod::Arbiter);
    // The offline arbiter counts question tokens: the exact-address
    // candidate wins deterministically.
    assert_eq!(result.resolved_siret.as_deref(), Some(SIRET_NORD));
    assert!(result.alternatives.contains(&SIRET_SUD.to_string()));
    assert!(!result
        .alternatives
        .contains(&result.resolved_siret.clone().unwrap()));
}

#[test]
fn test_department_scope_recorded() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();
    let mut oracle = OfflineOracle::new();

    let raw = supplier(&[
        ("Auxiliaire", "S7"),
        ("Nom", "Dupont Logistique SAS"),
        ("Adresse 1", "10 RUE DE LA PAIX"),
        ("Postal", "75001"),
        ("Ville", "Paris"),
    ]);
    let result = match_supplier_row(&store, &raw, &mut oracle).unwrap();
    assert_eq!(
        result.debug.get("search_scope").and_then(|v| v.as_str()),
        Some("department_75")
    );
}

#[test]
fn test_store_active_only() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();

    // The closed establishment is neither directly addressable...
    assert!(store.direct_lookup(SIRET_INACTIVE).unwrap().is_none());
    // ...nor present in the partition tree.
    let hits = store
        .fetch_by_sirens(Some("75"), &["111111111".to_string()])
        .unwrap();
    assert!(hits.iter().all(|e| e.siret != SIRET_INACTIVE));
    assert!(hits.iter().any(|e| e.siret == SIRET_NORD));
}

#[test]
fn test_closed_company_never_resolves() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();

    // The establishment is active but its company is closed: it has no
    // denomination to match against, so the search path never sees it.
    let hits = store
        .fetch_by_sirens(Some("75"), &["444444444".to_string()])
        .unwrap();
    assert!(hits.is_empty());
    // A direct identifier hit still resolves; the company join is optional
    // there and the official name simply stays empty.
    let direct = store.direct_lookup(SIRET_CLOSED_COMPANY).unwrap().unwrap();
    assert_eq!(direct.official_name, None);
}

#[test]
fn test_fts_ranking_convention() {
    let dir = TempDir::new().unwrap();
    let paths = build_fixture_registry(dir.path());
    let store = RegistryStore::open(&paths.db_path).unwrap();

    let candidates = store.fts_candidates("LOGISTIQUE", 20).unwrap();
    assert_eq!(candidates.len(), 2);
    // Lower-is-better ordering.
    for pair in candidates.windows(2) {
        assert!(pair[0].score <= pair[1].score);
    }
    // Companies without the token or without an active state never appear.
    assert!(store.fts_candidates("COMPTOIR", 20).unwrap().is_empty());
}
