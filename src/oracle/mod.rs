mod offline;
mod remote;

pub use offline::OfflineOracle;
pub use remote::RemoteOracle;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::SupplierRow;
use crate::registry::Establishment;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("credential variable {0} is not set")]
    MissingCredential(&'static str),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("malformed oracle response: {0}")]
    MalformedResponse(String),
}

pub type Result<T> = std::result::Result<T, OracleError>;

/// Credential variable for the remote oracle; absent means the offline
/// heuristic is used throughout.
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Legal-form suffixes stripped from company names before matching.
pub const LEGAL_SUFFIXES: [&str; 14] = [
    "SASU",
    "SAS",
    "SARL",
    "EURL",
    "SA",
    "SCI",
    "SNC",
    "SC",
    "SCA",
    "SCOP",
    "SELARL",
    "SELAFA",
    "GIE",
    "ASSOCIATION",
];

/// Normalized supplier fields produced by the cleaning oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedSupplier {
    /// Uppercase, whitespace-collapsed name with legal suffixes removed.
    pub clean_name: String,
    /// Most distinctive alphanumeric token of the clean name.
    pub search_token: String,
    /// Exactly five digits, never "00000".
    pub clean_postal: Option<String>,
    /// Uppercase, whitespace-collapsed.
    pub clean_city: Option<String>,
}

/// Pick between two near-tied candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    A,
    B,
}

/// Advisory service consulted by the matcher: normalizes a raw supplier row
/// and arbitrates between near-ties. Implementations are infallible from the
/// caller's point of view; the remote variant degrades to the offline rules
/// on any error. Memoization is per instance.
pub trait CleaningOracle: Send {
    fn clean(&mut self, raw: &SupplierRow) -> CleanedSupplier;

    fn arbitrate(&mut self, question: &str, a: &Establishment, b: &Establishment) -> Choice;
}

/// A postal code is useful only as exactly five digits; "00000" is a
/// placeholder, not a location.
pub(crate) fn validate_postal(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.len() == 5
        && candidate != "00000"
        && candidate.chars().all(|c| c.is_ascii_digit())
    {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Cache key over the fields the oracle actually looks at.
pub(crate) fn fingerprint(raw: &SupplierRow) -> String {
    format!(
        "{}|{}|{}|{}",
        raw.text("Nom"),
        raw.text("Adresse 1"),
        raw.text("Postal"),
        raw.text("Ville"),
    )
}

/// Which oracle the pipeline should instantiate in each worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleMode {
    Offline,
    Remote,
}

impl OracleMode {
    /// Remote when the credential variable is set, offline otherwise.
    pub fn from_env() -> Self {
        match std::env::var(API_KEY_VAR) {
            Ok(key) if !key.trim().is_empty() => OracleMode::Remote,
            _ => OracleMode::Offline,
        }
    }
}

/// Build a fresh oracle instance for one worker.
pub fn build(mode: OracleMode, timeout_secs: u64) -> Box<dyn CleaningOracle> {
    match mode {
        OracleMode::Offline => Box::new(OfflineOracle::new()),
        OracleMode::Remote => match RemoteOracle::from_env(timeout_secs) {
            Ok(oracle) => Box::new(oracle),
            Err(err) => {
                tracing::warn!("remote oracle unavailable ({err}), using offline rules");
                Box::new(OfflineOracle::new())
            }
        },
    }
}
