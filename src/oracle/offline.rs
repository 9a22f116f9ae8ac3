use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::matcher::text::normalize;
use crate::pipeline::{Scalar, SupplierRow};
use crate::registry::Establishment;

use super::{fingerprint, validate_postal, Choice, CleanedSupplier, CleaningOracle, LEGAL_SUFFIXES};

lazy_static! {
    static ref ALNUM_TOKEN: Regex = Regex::new(r"[A-Z0-9]+").unwrap();
    static ref POSTAL: Regex = Regex::new(r"\b(\d{5})\b").unwrap();
    static ref SUFFIX: Regex =
        Regex::new(&format!(r"\b(?:{})\b", LEGAL_SUFFIXES.join("|"))).unwrap();
}

/// Deterministic local cleaning rules; also the degradation target of the
/// remote oracle and the reference behavior for tests.
#[derive(Debug, Default)]
pub struct OfflineOracle {
    clean_cache: HashMap<String, CleanedSupplier>,
}

impl OfflineOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn clean_uncached(raw: &SupplierRow) -> CleanedSupplier {
        let name_raw = raw.first_text(&["Nom", "name"]);
        let addr_raw = raw.first_text(&["Adresse 1", "address"]);
        let city_raw = raw.first_text(&["Ville", "city"]);

        let clean_name = normalize(&strip_legal_suffixes(&name_raw));

        let tokens: Vec<&str> = ALNUM_TOKEN
            .find_iter(&clean_name)
            .map(|m| m.as_str())
            .filter(|t| !LEGAL_SUFFIXES.contains(t))
            .collect();
        let search_token = tokens
            .iter()
            .max_by_key(|t| t.len())
            .map(|t| t.to_string())
            .unwrap_or_else(|| {
                let truncated: String = clean_name.chars().take(20).collect();
                if truncated.is_empty() {
                    "UNKNOWN".to_string()
                } else {
                    truncated
                }
            });

        let clean_postal = match raw.get("Postal").or_else(|| raw.get("cp")) {
            Some(Scalar::Number(n)) if n.is_finite() && *n >= 0.0 => {
                validate_postal(&format!("{:05}", *n as u64))
            }
            Some(scalar) => {
                extract_postal(&scalar.render()).or_else(|| extract_postal(&addr_raw))
            }
            None => extract_postal(&addr_raw),
        };

        let clean_city = if city_raw.trim().is_empty() {
            None
        } else {
            Some(normalize(&city_raw))
        };

        CleanedSupplier {
            clean_name,
            search_token,
            clean_postal,
            clean_city,
        }
    }
}

impl CleaningOracle for OfflineOracle {
    fn clean(&mut self, raw: &SupplierRow) -> CleanedSupplier {
        let key = fingerprint(raw);
        if let Some(cached) = self.clean_cache.get(&key) {
            return cached.clone();
        }
        let cleaned = Self::clean_uncached(raw);
        self.clean_cache.insert(key, cleaned.clone());
        cleaned
    }

    /// Head office wins; otherwise the candidate whose address shares more
    /// tokens with the question; ties go to A.
    fn arbitrate(&mut self, question: &str, a: &Establishment, b: &Establishment) -> Choice {
        if a.is_siege != b.is_siege {
            return if a.is_siege { Choice::A } else { Choice::B };
        }
        let a_addr = normalize(&a.address);
        let b_addr = normalize(&b.address);
        let q = normalize(question);
        let a_hits = ALNUM_TOKEN
            .find_iter(&q)
            .filter(|m| a_addr.contains(m.as_str()))
            .count();
        let b_hits = ALNUM_TOKEN
            .find_iter(&q)
            .filter(|m| b_addr.contains(m.as_str()))
            .count();
        if a_hits != b_hits {
            return if a_hits > b_hits { Choice::A } else { Choice::B };
        }
        Choice::A
    }
}

fn strip_legal_suffixes(name: &str) -> String {
    SUFFIX
        .replace_all(&name.to_uppercase(), " ")
        .to_string()
}

fn extract_postal(text: &str) -> Option<String> {
    POSTAL
        .captures(text)
        .and_then(|caps| validate_postal(&caps[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, addr: &str, postal: &str, city: &str) -> SupplierRow {
        let mut row = SupplierRow::new();
        row.insert("Nom", Scalar::Text(name.into()));
        row.insert("Adresse 1", Scalar::Text(addr.into()));
        row.insert("Postal", Scalar::Text(postal.into()));
        row.insert("Ville", Scalar::Text(city.into()));
        row
    }

    #[test]
    fn test_clean_strips_legal_suffixes() {
        let mut oracle = OfflineOracle::new();
        let cleaned = oracle.clean(&row("Dupont Logistique SAS", "", "75001", "Paris"));
        assert_eq!(cleaned.clean_name, "DUPONT LOGISTIQUE");
        assert_eq!(cleaned.search_token, "LOGISTIQUE");
        assert_eq!(cleaned.clean_postal.as_deref(), Some("75001"));
        assert_eq!(cleaned.clean_city.as_deref(), Some("PARIS"));
    }

    #[test]
    fn test_clean_postal_from_numeric_cell() {
        let mut oracle = OfflineOracle::new();
        let mut r = row("ACME", "", "", "Nice");
        r.insert("Postal", Scalar::Number(6000.0));
        let cleaned = oracle.clean(&r);
        assert_eq!(cleaned.clean_postal.as_deref(), Some("06000"));
    }

    #[test]
    fn test_clean_postal_falls_back_to_address() {
        let mut oracle = OfflineOracle::new();
        let cleaned = oracle.clean(&row("ACME", "10 rue X 69001 Lyon", "", ""));
        assert_eq!(cleaned.clean_postal.as_deref(), Some("69001"));
        assert_eq!(cleaned.clean_city, None);
    }

    #[test]
    fn test_clean_rejects_null_island_postal() {
        let mut oracle = OfflineOracle::new();
        let cleaned = oracle.clean(&row("ACME", "", "00000", ""));
        assert_eq!(cleaned.clean_postal, None);
    }

    #[test]
    fn test_search_token_skips_suffixes_and_prefers_longest() {
        let mut oracle = OfflineOracle::new();
        let cleaned = oracle.clean(&row("SA TRANSPORTS MARTIN", "", "", ""));
        assert_eq!(cleaned.search_token, "TRANSPORTS");
    }

    #[test]
    fn test_search_token_for_blank_name() {
        let mut oracle = OfflineOracle::new();
        let cleaned = oracle.clean(&row("", "", "", ""));
        assert_eq!(cleaned.search_token, "UNKNOWN");
    }

    fn establishment(siret: &str, address: &str, is_siege: bool) -> Establishment {
        Establishment {
            siret: siret.into(),
            siren: Establishment::siren_of(siret).into(),
            official_name: Some("TEST".into()),
            city: "PARIS".into(),
            address: address.into(),
            is_siege,
        }
    }

    #[test]
    fn test_arbitrate_prefers_head_office() {
        let mut oracle = OfflineOracle::new();
        let a = establishment("11111111100011", "1 RUE A", false);
        let b = establishment("22222222200022", "2 RUE B", true);
        assert_eq!(oracle.arbitrate("which one?", &a, &b), Choice::B);
    }

    #[test]
    fn test_arbitrate_counts_question_tokens() {
        let mut oracle = OfflineOracle::new();
        let a = establishment("11111111100011", "10 RUE DE LA PAIX", false);
        let b = establishment("22222222200022", "99 AVENUE DES CHAMPS", false);
        let choice = oracle.arbitrate("Which address best matches '10 RUE DE LA PAIX'?", &a, &b);
        assert_eq!(choice, Choice::A);
    }

    #[test]
    fn test_arbitrate_tie_is_deterministic() {
        let mut oracle = OfflineOracle::new();
        let a = establishment("11111111100011", "1 RUE X", false);
        let b = establishment("22222222200022", "1 RUE X", false);
        assert_eq!(oracle.arbitrate("?", &a, &b), Choice::A);
    }
}
