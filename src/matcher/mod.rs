mod engine;
pub mod text;

pub use engine::match_supplier_row;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("registry error: {0}")]
    RegistryError(#[from] crate::registry::RegistryError),
}

pub type Result<T> = std::result::Result<T, MatchError>;

/// How a supplier row was resolved. The variants are evaluated in the order
/// of the resolution rules; `NotFound` carries no identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMethod {
    DirectId,
    StrictLocal,
    Calculated,
    Arbiter,
    NotFound,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::DirectId => "DIRECT_ID",
            MatchMethod::StrictLocal => "STRICT_LOCAL",
            MatchMethod::Calculated => "CALCULATED",
            MatchMethod::Arbiter => "ARBITER",
            MatchMethod::NotFound => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution of one supplier row.
///
/// Invariants: `NotFound` has no siret and confidence 0.0; `DirectId` has
/// confidence 1.0; `alternatives` never contains `resolved_siret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub input_id: String,
    pub resolved_siret: Option<String>,
    pub official_name: Option<String>,
    /// In 0.0..=1.0.
    pub confidence_score: f64,
    pub match_method: MatchMethod,
    /// Up to five runner-up sirets, best first.
    pub alternatives: Vec<String>,
    /// Opaque provenance: step reached, candidate counts, search scope.
    pub debug: serde_json::Map<String, serde_json::Value>,
}

impl MatchResult {
    pub fn alternatives_json(&self) -> String {
        serde_json::to_string(&self.alternatives).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_labels() {
        assert_eq!(MatchMethod::DirectId.as_str(), "DIRECT_ID");
        assert_eq!(MatchMethod::NotFound.to_string(), "NOT_FOUND");
    }

    #[test]
    fn test_alternatives_json() {
        let result = MatchResult {
            input_id: "S1".into(),
            resolved_siret: None,
            official_name: None,
            confidence_score: 0.0,
            match_method: MatchMethod::NotFound,
            alternatives: vec!["12345678900014".into()],
            debug: serde_json::Map::new(),
        };
        assert_eq!(result.alternatives_json(), "[\"12345678900014\"]");
    }
}
