//! The resolution state machine: identifier lookup, strict local search,
//! broad full-text search, scoring, and arbitration, evaluated in order.
//! The first rule that emits a result wins.

use serde_json::{json, Map, Value};

use crate::oracle::{Choice, CleaningOracle};
use crate::pipeline::SupplierRow;
use crate::registry::{Establishment, RegistryStore, DEFAULT_FTS_LIMIT};

use super::text::{
    compose_address, extract_siren_from_vat, extract_siret, levenshtein, normalize,
    token_set_ratio, token_sort_ratio,
};
use super::{MatchMethod, MatchResult, Result};

/// Score contributions and decision thresholds, on a 0..100 scale.
const NAME_POINTS: f64 = 40.0;
const CITY_POINTS: f64 = 30.0;
const ADDRESS_POINTS: f64 = 20.0;
const HEAD_OFFICE_POINTS: f64 = 10.0;
const NAME_SIMILARITY_GATE: f64 = 0.9;
const ADDRESS_SIMILARITY_GATE: f64 = 0.8;
const ACCEPT_SCORE: f64 = 80.0;
const REJECT_SCORE: f64 = 50.0;
const TIE_MARGIN: f64 = 2.0;

/// Candidate city must be within this edit distance of the supplier city.
const CITY_DISTANCE_LIMIT: usize = 3;
/// Candidate address must be within this edit distance of the supplier address.
const ADDRESS_DISTANCE_LIMIT: usize = 10;

/// Maximum runner-up sirets reported alongside a decision.
const MAX_ALTERNATIVES: usize = 5;

struct Scored {
    est: Establishment,
    name_sim: f64,
    addr_sim: f64,
    score: f64,
}

/// Resolve one raw supplier row against the registry.
pub fn match_supplier_row(
    store: &RegistryStore,
    raw: &SupplierRow,
    oracle: &mut dyn CleaningOracle,
) -> Result<MatchResult> {
    let input_id = raw.input_id();
    let mut debug = Map::new();
    debug.insert("input_id".into(), json!(input_id));

    // Rule 1: a verifiable identifier short-circuits everything else.
    if let Some(siret) = extract_siret(&raw.scalar("Code SIRET")) {
        if let Some(hit) = store.direct_lookup(&siret)? {
            debug.insert("step".into(), json!("DIRECT_ID"));
            debug.insert("hit".into(), establishment_value(&hit));
            return Ok(MatchResult {
                input_id,
                resolved_siret: Some(hit.siret.clone()),
                official_name: hit.official_name.clone(),
                confidence_score: 1.0,
                match_method: MatchMethod::DirectId,
                alternatives: Vec::new(),
                debug,
            });
        }
    }

    // A VAT-derived siren is not establishment-precise; record it and keep
    // searching.
    if let Some(siren) = extract_siren_from_vat(&raw.text("Code NIF")) {
        debug.insert("siren_from_nif".into(), json!(siren));
    }

    // Rule 2: normalize the row through the cleaning oracle.
    let cleaned = oracle.clean(raw);
    debug.insert(
        "cleaned".into(),
        serde_json::to_value(&cleaned).unwrap_or(Value::Null),
    );

    let supplier_city = cleaned
        .clean_city
        .clone()
        .unwrap_or_else(|| normalize(&raw.text("Ville")));
    let supplier_address = compose_address(&[
        &raw.text("Adresse 1"),
        &raw.text("Adresse 2"),
        &raw.text("Adresse 3"),
    ]);

    // Rule 3: a unique hit on exact postal code + near-exact name settles it.
    if let Some(postal) = &cleaned.clean_postal {
        let strict_hits = store.strict_local_lookup(postal, &cleaned.clean_name)?;
        debug.insert("strict_hits_n".into(), json!(strict_hits.len()));
        if strict_hits.len() == 1 {
            let hit = &strict_hits[0];
            debug.insert("step".into(), json!("STRICT_LOCAL"));
            debug.insert("hit".into(), establishment_value(hit));
            return Ok(MatchResult {
                input_id,
                resolved_siret: Some(hit.siret.clone()),
                official_name: hit.official_name.clone(),
                confidence_score: 0.95,
                match_method: MatchMethod::StrictLocal,
                alternatives: Vec::new(),
                debug,
            });
        }
    }

    // Rule 4: without any location signal a broad search cannot be trusted.
    if cleaned.clean_postal.is_none() && supplier_city.is_empty() {
        debug.insert("step".into(), json!("NO_LOCATION"));
        return Ok(not_found(input_id, Vec::new(), debug));
    }

    // Rule 5: full-text candidates on the distinctive token, then their
    // establishments, region-scoped when a postal code is known.
    let fts = store.fts_candidates(&cleaned.search_token, DEFAULT_FTS_LIMIT)?;
    debug.insert("fts_n".into(), json!(fts.len()));
    let sirens: Vec<String> = fts.into_iter().map(|c| c.siren).collect();

    let establishments = match &cleaned.clean_postal {
        Some(postal) => {
            let prefix = &postal[..2];
            debug.insert("search_scope".into(), json!(format!("department_{prefix}")));
            store.fetch_by_sirens(Some(prefix), &sirens)?
        }
        None => {
            debug.insert("search_scope".into(), json!("nationwide"));
            store.fetch_by_sirens(None, &sirens)?
        }
    };
    debug.insert("estabs_n".into(), json!(establishments.len()));

    // Rule 6: drop candidates whose city or address is too far off.
    let filtered: Vec<Establishment> = establishments
        .into_iter()
        .filter(|est| {
            let candidate_city = normalize(&est.city);
            if !supplier_city.is_empty()
                && levenshtein(&candidate_city, &supplier_city) >= CITY_DISTANCE_LIMIT
            {
                return false;
            }
            let candidate_address = normalize(&est.address);
            if !supplier_address.is_empty()
                && levenshtein(&candidate_address, &supplier_address) >= ADDRESS_DISTANCE_LIMIT
            {
                return false;
            }
            true
        })
        .collect();
    debug.insert("filtered_n".into(), json!(filtered.len()));

    if filtered.is_empty() {
        debug.insert("step".into(), json!("NOT_FOUND"));
        return Ok(not_found(input_id, Vec::new(), debug));
    }

    // Rule 7: score and sort (stable, so storage order breaks ties).
    let mut scored: Vec<Scored> = filtered
        .into_iter()
        .map(|est| score_candidate(est, &cleaned.clean_name, &supplier_city, &supplier_address))
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    debug.insert(
        "top_scores".into(),
        json!(scored.iter().take(5).map(|c| c.score).collect::<Vec<_>>()),
    );

    let alternatives: Vec<String> = scored
        .iter()
        .skip(1)
        .take(MAX_ALTERNATIVES)
        .map(|c| c.est.siret.clone())
        .collect();
    let top = &scored[0];

    // Rule 8: decide.
    if top.score > ACCEPT_SCORE {
        debug.insert("step".into(), json!("CALCULATED"));
        debug.insert("top".into(), scored_value(top));
        return Ok(calculated(input_id, top, alternatives, debug));
    }

    if top.score < REJECT_SCORE {
        debug.insert("step".into(), json!("LOW_SCORE"));
        debug.insert("top".into(), scored_value(top));
        return Ok(not_found(input_id, alternatives, debug));
    }

    if scored.len() >= 2 && (scored[0].score - scored[1].score).abs() <= TIE_MARGIN {
        let question = format!("Which address best matches '{supplier_address}'?");
        let choice = oracle.arbitrate(&question, &scored[0].est, &scored[1].est);
        let pick = match choice {
            Choice::A => &scored[0],
            Choice::B => &scored[1],
        };
        // Runner-ups must not repeat the pick.
        let alternatives: Vec<String> = alternatives
            .into_iter()
            .filter(|siret| siret != &pick.est.siret)
            .collect();
        debug.insert("step".into(), json!("ARBITER"));
        debug.insert("choice".into(), json!(if choice == Choice::A { "A" } else { "B" }));
        debug.insert("a".into(), establishment_value(&scored[0].est));
        debug.insert("b".into(), establishment_value(&scored[1].est));
        return Ok(MatchResult {
            input_id,
            resolved_siret: Some(pick.est.siret.clone()),
            official_name: pick.est.official_name.clone(),
            confidence_score: (pick.score / 100.0).min(1.0),
            match_method: MatchMethod::Arbiter,
            alternatives,
            debug,
        });
    }

    debug.insert("step".into(), json!("CALCULATED_FALLBACK"));
    debug.insert("top".into(), scored_value(top));
    Ok(calculated(input_id, top, alternatives, debug))
}

fn score_candidate(
    est: Establishment,
    clean_name: &str,
    supplier_city: &str,
    supplier_address: &str,
) -> Scored {
    let name_sim = token_sort_ratio(clean_name, est.official_name.as_deref().unwrap_or(""));
    let city_match = supplier_city == normalize(&est.city);
    let addr_sim = token_set_ratio(supplier_address, &est.address);

    let mut score = 0.0;
    if name_sim > NAME_SIMILARITY_GATE {
        score += NAME_POINTS;
    }
    if city_match {
        score += CITY_POINTS;
    }
    if addr_sim > ADDRESS_SIMILARITY_GATE {
        score += ADDRESS_POINTS;
    }
    if est.is_siege {
        score += HEAD_OFFICE_POINTS;
    }
    Scored {
        est,
        name_sim,
        addr_sim,
        score,
    }
}

fn calculated(
    input_id: String,
    top: &Scored,
    alternatives: Vec<String>,
    debug: Map<String, Value>,
) -> MatchResult {
    MatchResult {
        input_id,
        resolved_siret: Some(top.est.siret.clone()),
        official_name: top.est.official_name.clone(),
        confidence_score: (top.score / 100.0).min(1.0),
        match_method: MatchMethod::Calculated,
        alternatives,
        debug,
    }
}

fn not_found(
    input_id: String,
    alternatives: Vec<String>,
    debug: Map<String, Value>,
) -> MatchResult {
    MatchResult {
        input_id,
        resolved_siret: None,
        official_name: None,
        confidence_score: 0.0,
        match_method: MatchMethod::NotFound,
        alternatives,
        debug,
    }
}

fn establishment_value(est: &Establishment) -> Value {
    serde_json::to_value(est).unwrap_or(Value::Null)
}

fn scored_value(candidate: &Scored) -> Value {
    json!({
        "siret": candidate.est.siret,
        "official_name": candidate.est.official_name,
        "name_sim": candidate.name_sim,
        "addr_sim": candidate.addr_sim,
        "score_100": candidate.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establishment(siret: &str, name: &str, city: &str, address: &str, siege: bool) -> Establishment {
        Establishment {
            siret: siret.into(),
            siren: Establishment::siren_of(siret).into(),
            official_name: Some(name.into()),
            city: city.into(),
            address: address.into(),
            is_siege: siege,
        }
    }

    #[test]
    fn test_score_full_match() {
        let est = establishment(
            "11111111100011",
            "DUPONT LOGISTIQUE",
            "PARIS",
            "10 RUE DE LA PAIX",
            true,
        );
        let scored = score_candidate(est, "DUPONT LOGISTIQUE", "PARIS", "10 RUE DE LA PAIX");
        assert_eq!(scored.score, 100.0);
    }

    #[test]
    fn test_score_city_and_address_only() {
        let est = establishment(
            "11111111100011",
            "SOMETHING ELSE ENTIRELY",
            "PARIS",
            "10 RUE DE LA PAIX",
            false,
        );
        let scored = score_candidate(est, "DUPONT LOGISTIQUE", "PARIS", "10 RUE DE LA PAIX");
        assert_eq!(scored.score, CITY_POINTS + ADDRESS_POINTS);
    }

    #[test]
    fn test_score_head_office_bonus() {
        let base = establishment("11111111100011", "X", "LYON", "ELSEWHERE", false);
        let siege = establishment("11111111100011", "X", "LYON", "ELSEWHERE", true);
        let s1 = score_candidate(base, "NAME", "", "");
        let s2 = score_candidate(siege, "NAME", "", "");
        assert_eq!(s2.score - s1.score, HEAD_OFFICE_POINTS);
    }
}
