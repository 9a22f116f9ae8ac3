//! Shared fixtures: a miniature registry built from generated archives.
// Not every test binary touches every fixture item.
#![allow(dead_code)]

use std::fs::File;
use std::path::Path;

use polars::prelude::*;
use sirene_rs::registry::{build_registry, BuildOptions, RegistryPaths};

/// Two companies share the "LOGISTIQUE" token in the 75 region, one sits in
/// 69, one is administratively closed, and one establishment is inactive.
pub const SIRET_NORD: &str = "11111111100011";
pub const SIRET_SUD: &str = "22222222200022";
pub const SIRET_MARTIN: &str = "33333333300033";
pub const SIRET_CLOSED_COMPANY: &str = "44444444400044";
pub const SIRET_INACTIVE: &str = "11111111100099";

pub fn build_fixture_registry(dir: &Path) -> RegistryPaths {
    let paths = RegistryPaths {
        companies_parquet: dir.join("StockUniteLegale_utf8.parquet"),
        establishments_parquet: dir.join("StockEtablissement_utf8.parquet"),
        db_path: dir.join("sirene.db"),
        partitions_dir: dir.join("sirene_partitions"),
    };

    let mut companies = df!(
        "siren" => [
            "111111111",
            "222222222",
            "333333333",
            "444444444",
            "555555555",
        ],
        "denominationUniteLegale" => [
            Some("Dupont Logistique Nord"),
            Some("Dupont Logistique Sud"),
            Some("Martin Freres"),
            Some("Vieux Comptoir"),
            None,
        ],
        "activitePrincipaleUniteLegale" => [
            Some("52.29A"),
            Some("52.29A"),
            Some("41.20B"),
            Some("47.11Z"),
            Some("47.11Z"),
        ],
        "etatAdministratifUniteLegale" => ["A", "A", "A", "C", "A"],
    )
    .expect("companies frame");
    write_parquet(&paths.companies_parquet, &mut companies);

    let mut establishments = df!(
        "siret" => [
            SIRET_NORD,
            SIRET_SUD,
            SIRET_MARTIN,
            SIRET_CLOSED_COMPANY,
            SIRET_INACTIVE,
        ],
        "siren" => [
            "111111111",
            "222222222",
            "333333333",
            "444444444",
            "111111111",
        ],
        "etatAdministratifEtablissement" => ["A", "A", "A", "A", "F"],
        "libelleCommuneEtablissement" => [
            Some("Paris"),
            Some("Paris"),
            Some("Lyon"),
            Some("Paris"),
            Some("Paris"),
        ],
        "codePostalEtablissement" => [
            Some("75001"),
            Some("75001"),
            Some("69001"),
            Some("75002"),
            Some("75001"),
        ],
        "numeroVoieEtablissement" => [
            Some("10"),
            Some("10"),
            Some("5"),
            Some("1"),
            Some("99"),
        ],
        "typeVoieEtablissement" => [
            Some("RUE"),
            Some("RUE"),
            Some("AVENUE"),
            Some("RUE"),
            Some("RUE"),
        ],
        "libelleVoieEtablissement" => [
            Some("DE LA PAIX"),
            Some("DE LA PAIG"),
            Some("BERTHELOT"),
            Some("DES HALLES"),
            Some("FERMEE"),
        ],
        "complementAdresseEtablissement" => [
            None::<&str>,
            None::<&str>,
            None::<&str>,
            None::<&str>,
            None::<&str>,
        ],
        "distributionSpecialeEtablissement" => [
            None::<&str>,
            None::<&str>,
            None::<&str>,
            None::<&str>,
            None::<&str>,
        ],
        "etablissementSiege" => [false, false, true, true, false],
    )
    .expect("establishments frame");
    write_parquet(&paths.establishments_parquet, &mut establishments);

    build_registry(&paths, &BuildOptions::default()).expect("registry build");
    paths
}

fn write_parquet(path: &Path, df: &mut DataFrame) {
    let file = File::create(path).expect("create parquet file");
    ParquetWriter::new(file).finish(df).expect("write parquet");
}

/// A two-row supplier CSV: one row resolvable through its identifier, one
/// that exists nowhere in the registry.
pub fn write_supplier_csv(path: &Path) {
    let mut writer = csv::Writer::from_path(path).expect("create supplier csv");
    writer
        .write_record([
            "Auxiliaire",
            "Nom",
            "Adresse 1",
            "Adresse 2",
            "Adresse 3",
            "Postal",
            "Ville",
            "Code SIRET",
            "Code NIF",
        ])
        .unwrap();
    writer
        .write_record([
            "S1",
            "Dupont Logistique Nord",
            "10 RUE DE LA PAIX",
            "",
            "",
            "75001",
            "Paris",
            SIRET_NORD,
            "",
        ])
        .unwrap();
    writer
        .write_record([
            "S2",
            "SOCIETE INEXISTANTE XYZ QQQ",
            "99 RUE NULLE",
            "",
            "",
            "75001",
            "Paris",
            "",
            "",
        ])
        .unwrap();
    writer.flush().unwrap();
}
