use serde::{Deserialize, Serialize};

/// One physical site of a company, as stored in the partition tree.
///
/// Invariant: `siret` is 14 digits and `siren` is its first 9 digits.
/// Only active establishments are admitted into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Establishment {
    pub siret: String,
    pub siren: String,
    /// Denomination of the owning company, when the company is active.
    pub official_name: Option<String>,
    /// Uppercased commune name.
    pub city: String,
    /// Uppercased concatenation of the address line components.
    pub address: String,
    /// Head office of the company; preferred in tie-breaks.
    pub is_siege: bool,
}

impl Establishment {
    /// The 9-digit company identifier embedded in a 14-digit siret.
    pub fn siren_of(siret: &str) -> &str {
        &siret[..siret.len().min(9)]
    }
}

/// One legal unit from the `companies_active` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub siren: String,
    pub denomination: String,
    pub principal_activity: Option<String>,
    pub administrative_state: String,
}

/// A ranked full-text hit on the company denomination index.
/// `score` follows the BM25 convention of the store: lower is better.
#[derive(Debug, Clone)]
pub struct FtsCandidate {
    pub siren: String,
    pub denomination: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_siren_of() {
        assert_eq!(Establishment::siren_of("12345678900014"), "123456789");
        assert_eq!(Establishment::siren_of("12345"), "12345");
    }
}
