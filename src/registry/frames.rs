//! Shared polars plumbing for the establishment archives and partitions.

use std::path::Path;

use polars::prelude::*;

use super::model::Establishment;
use super::Result;

pub(super) fn scan(path: &Path) -> Result<LazyFrame> {
    let args = ScanArgsParquet::default();
    let lf = LazyFrame::scan_parquet(PlPath::new(&path.to_string_lossy()), args)?;
    Ok(lf)
}

/// Uppercased concatenation of number + street-type + street-name +
/// complement + special-distribution, null components skipped.
pub(super) fn composed_address_expr() -> Expr {
    concat_str(
        [
            col("numeroVoieEtablissement").cast(DataType::String),
            col("typeVoieEtablissement").cast(DataType::String),
            col("libelleVoieEtablissement").cast(DataType::String),
            col("complementAdresseEtablissement").cast(DataType::String),
            col("distributionSpecialeEtablissement").cast(DataType::String),
        ],
        " ",
        true,
    )
    .str()
    .to_uppercase()
}

/// Projects a raw establishment archive onto the canonical partition shape,
/// keeping only active rows with a non-null siret.
pub(super) fn canonical_establishments(lf: LazyFrame) -> LazyFrame {
    let postal = col("codePostalEtablissement")
        .cast(DataType::String)
        .fill_null(lit(""))
        .str()
        .to_uppercase();
    lf.filter(
        col("etatAdministratifEtablissement")
            .eq(lit("A"))
            .and(col("siret").is_not_null()),
    )
    .select([
        col("siret").cast(DataType::String),
        col("siren").cast(DataType::String),
        col("libelleCommuneEtablissement")
            .cast(DataType::String)
            .fill_null(lit(""))
            .str()
            .to_uppercase()
            .alias("libelleCommuneEtablissement"),
        postal.clone().alias("codePostalEtablissement"),
        composed_address_expr().alias("address"),
        col("etablissementSiege")
            .cast(DataType::Boolean)
            .fill_null(lit(false))
            .alias("is_siege"),
        postal.str().slice(lit(0), lit(2)).alias("region_prefix"),
    ])
}

pub(super) fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<()> {
    let file = std::fs::File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(df)?;
    Ok(())
}

pub(super) fn str_at(df: &DataFrame, name: &str, idx: usize) -> Result<String> {
    let series = df.column(name)?.as_materialized_series();
    let value = match series.get(idx)? {
        AnyValue::Null => String::new(),
        AnyValue::String(v) => v.to_string(),
        AnyValue::StringOwned(v) => v.to_string(),
        other => other.to_string(),
    };
    Ok(value)
}

pub(super) fn bool_at(df: &DataFrame, name: &str, idx: usize) -> Result<bool> {
    let series = df.column(name)?.as_materialized_series();
    let value = match series.get(idx)? {
        AnyValue::Boolean(v) => v,
        _ => false,
    };
    Ok(value)
}

/// Reads a canonical-shape frame back into establishment values.
/// `official_name` is left unset; the caller joins denominations.
pub(super) fn establishments_from(df: &DataFrame) -> Result<Vec<Establishment>> {
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        out.push(Establishment {
            siret: str_at(df, "siret", i)?,
            siren: str_at(df, "siren", i)?,
            official_name: None,
            city: str_at(df, "libelleCommuneEtablissement", i)?,
            address: str_at(df, "address", i)?,
            is_siege: bool_at(df, "is_siege", i)?,
        });
    }
    Ok(out)
}
