//! Text normalization and the deterministic similarity metrics.
//!
//! All comparisons run on uppercased, whitespace-collapsed strings. The base
//! similarity is `strsim::normalized_levenshtein` (0..1); the token-sort and
//! token-set ratios below are built on it:
//!
//! - `token_sort_ratio(a, b)`: split on whitespace, sort tokens
//!   lexicographically, rejoin with single spaces, take the base ratio.
//! - `token_set_ratio(a, b)`: with I the sorted token intersection and
//!   Ra/Rb the sorted remainders, the maximum base ratio among
//!   (I, I+Ra), (I, I+Rb) and (I+Ra, I+Rb).
//!
//! Both token ratios are 0.0 when either side has no tokens.

use lazy_static::lazy_static;
use regex::Regex;

use crate::pipeline::Scalar;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref NON_DIGITS: Regex = Regex::new(r"\D+").unwrap();
    /// French VAT shape: FR + 2 check digits + 9-digit siren.
    static ref VAT_SIREN: Regex = Regex::new(r"FR\d{2}(\d{9})").unwrap();
}

/// Uppercase and collapse runs of whitespace.
pub fn normalize(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").to_uppercase()
}

pub fn digits_only(s: &str) -> String {
    NON_DIGITS.replace_all(s, "").to_string()
}

/// Join the non-blank address lines into one normalized string.
pub fn compose_address(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    normalize(&joined)
}

/// Parse a 14-digit establishment identifier. Spreadsheet exports often turn
/// ids into numbers, dropping leading zeros; a numeric cell is therefore
/// left-padded back to 14 digits. Text cells must contain exactly 14 digits
/// after stripping separators.
pub fn extract_siret(value: &Scalar) -> Option<String> {
    match value {
        Scalar::Number(n) => {
            if !n.is_finite() || *n < 0.0 || n.fract() != 0.0 {
                return None;
            }
            let padded = format!("{:014}", *n as u64);
            (padded.len() == 14).then_some(padded)
        }
        Scalar::Text(s) => {
            let digits = digits_only(s);
            (digits.len() == 14).then_some(digits)
        }
        _ => None,
    }
}

/// Pull the 9-digit company identifier out of a French VAT id, when present.
pub fn extract_siren_from_vat(raw: &str) -> Option<String> {
    let compact: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if let Some(caps) = VAT_SIREN.captures(&compact) {
        return Some(caps[1].to_string());
    }
    if compact.starts_with("FR") {
        let digits = digits_only(&compact);
        if digits.len() >= 9 {
            return Some(digits[digits.len() - 9..].to_string());
        }
    }
    None
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    strsim::levenshtein(a, b)
}

/// Base similarity in 0..1 (1.0 for two empty strings).
pub fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

fn sorted_tokens(s: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens
}

pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let tokens_a = sorted_tokens(a);
    let tokens_b = sorted_tokens(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    ratio(&tokens_a.join(" "), &tokens_b.join(" "))
}

pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a = sorted_tokens(a);
    let tokens_b = sorted_tokens(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let mut intersection = Vec::new();
    let mut rest_a = Vec::new();
    let mut remaining_b = tokens_b.clone();
    for token in &tokens_a {
        if let Some(pos) = remaining_b.iter().position(|t| t == token) {
            remaining_b.remove(pos);
            intersection.push(*token);
        } else {
            rest_a.push(*token);
        }
    }

    let base = intersection.join(" ");
    let combined_a = join_nonempty(&base, &rest_a.join(" "));
    let combined_b = join_nonempty(&base, &remaining_b.join(" "));

    let r1 = ratio(&base, &combined_a);
    let r2 = ratio(&base, &combined_b);
    let r3 = ratio(&combined_a, &combined_b);
    r1.max(r2).max(r3)
}

fn join_nonempty(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a} {b}"),
    }
}
