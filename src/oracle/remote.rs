use std::collections::HashMap;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use crate::pipeline::SupplierRow;
use crate::registry::Establishment;

use super::offline::OfflineOracle;
use super::{
    fingerprint, validate_postal, Choice, CleanedSupplier, CleaningOracle, OracleError, Result,
    API_KEY_VAR,
};
use crate::matcher::text::normalize;

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// Model-backed cleaning oracle. Every failure path (HTTP, timeout,
/// unparseable output) degrades to the offline rules for that call only.
pub struct RemoteOracle {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    endpoint: String,
    offline: OfflineOracle,
    clean_cache: HashMap<String, CleanedSupplier>,
    arbiter_cache: HashMap<String, Choice>,
}

impl RemoteOracle {
    pub fn from_env(timeout_secs: u64) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(OracleError::MissingCredential(API_KEY_VAR))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("sirene-rs/0.1.0")
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            offline: OfflineOracle::new(),
            clean_cache: HashMap::new(),
            arbiter_cache: HashMap::new(),
        })
    }

    /// Point the oracle at a different endpoint (tests, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.endpoint, self.model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()?
            .error_for_status()?;
        let value: Value = response.json()?;
        value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| OracleError::MalformedResponse("no text part in response".into()))
    }

    fn clean_remote(&self, raw: &SupplierRow) -> Result<CleanedSupplier> {
        let prompt = format!(
            "You are a French business data cleaning expert.\n\
             Task: Clean and correct this supplier record. Fix any spelling errors in company names.\n\n\
             Return JSON with keys: clean_name, search_token, clean_postal, clean_city.\n\n\
             Instructions:\n\
             - clean_name: CORRECT spelling errors (e.g., 'Goggle' -> 'GOOGLE', 'Carfour' -> 'CARREFOUR'), \
             then convert to UPPERCASE and remove legal suffixes (SAS, SARL, EURL, SA, etc.)\n\
             - search_token: Extract the most distinctive brand/company token from clean_name \
             (e.g., 'CARREFOUR' from 'CARREFOUR MARKET', 'GOOGLE' from 'GOOGLE FRANCE')\n\
             - clean_postal: Extract and normalize the 5-digit postal code from Postal or address fields. \
             Set to null if invalid/missing.\n\
             - clean_city: Correct city spelling if needed, convert to UPPERCASE. Set to null if missing.\n\n\
             Input: {}\n\n\
             Return ONLY the JSON object (no markdown, no explanation).",
            serde_json::to_string(raw).unwrap_or_default()
        );
        let text = self.generate(&prompt)?;
        let data = extract_json_object(&text)?;
        // Model output is advisory; the cleaning postconditions (uppercase,
        // collapsed whitespace, five-digit postal) are enforced here.
        Ok(CleanedSupplier {
            clean_name: normalize(&json_string(&data, "clean_name")),
            search_token: normalize(&json_string(&data, "search_token")),
            clean_postal: json_optional(&data, "clean_postal")
                .and_then(|p| validate_postal(&p)),
            clean_city: json_optional(&data, "clean_city").map(|c| normalize(&c)),
        })
    }

    fn arbitrate_remote(
        &self,
        question: &str,
        a: &Establishment,
        b: &Establishment,
    ) -> Result<Choice> {
        let prompt = format!(
            "You must choose A or B. Return JSON: {{\"choice\": \"A\"}} or {{\"choice\": \"B\"}}.\n\
             Question: {question}\n\
             A: {}\n\
             B: {}\n\
             Return ONLY the JSON object.",
            serde_json::to_string(a).unwrap_or_default(),
            serde_json::to_string(b).unwrap_or_default(),
        );
        let text = self.generate(&prompt)?;
        let data = extract_json_object(&text)?;
        match json_string(&data, "choice").trim().to_uppercase().as_str() {
            "A" => Ok(Choice::A),
            "B" => Ok(Choice::B),
            other => Err(OracleError::MalformedResponse(format!(
                "unexpected choice '{other}'"
            ))),
        }
    }
}

impl CleaningOracle for RemoteOracle {
    fn clean(&mut self, raw: &SupplierRow) -> CleanedSupplier {
        let key = fingerprint(raw);
        if let Some(cached) = self.clean_cache.get(&key) {
            return cached.clone();
        }
        let cleaned = match self.clean_remote(raw) {
            Ok(cleaned) => cleaned,
            Err(err) => {
                tracing::warn!("remote clean failed ({err}), falling back to offline rules");
                OfflineOracle::clean_uncached(raw)
            }
        };
        self.clean_cache.insert(key, cleaned.clone());
        cleaned
    }

    fn arbitrate(&mut self, question: &str, a: &Establishment, b: &Establishment) -> Choice {
        let key = format!("{question}|{}|{}", a.siret, b.siret);
        if let Some(cached) = self.arbiter_cache.get(&key) {
            return *cached;
        }
        let choice = match self.arbitrate_remote(question, a, b) {
            Ok(choice) => choice,
            Err(err) => {
                tracing::warn!("remote arbitration failed ({err}), falling back to offline rules");
                self.offline.arbitrate(question, a, b)
            }
        };
        self.arbiter_cache.insert(key, choice);
        choice
    }
}

/// First JSON object embedded in the model output.
fn extract_json_object(text: &str) -> Result<Value> {
    let raw = JSON_OBJECT
        .find(text)
        .ok_or_else(|| OracleError::MalformedResponse("no JSON object in response".into()))?;
    serde_json::from_str(raw.as_str())
        .map_err(|e| OracleError::MalformedResponse(format!("invalid JSON: {e}")))
}

fn json_string(value: &Value, key: &str) -> String {
    match &value[key] {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_optional(value: &Value, key: &str) -> Option<String> {
    let s = json_string(value, key);
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_from_markdown() {
        let text = "```json\n{\"choice\": \"B\"}\n```";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["choice"], "B");
    }

    #[test]
    fn test_extract_json_object_missing() {
        assert!(extract_json_object("no json here").is_err());
    }

    #[test]
    fn test_json_optional_treats_blank_as_absent() {
        let value: Value = serde_json::json!({"clean_postal": "", "clean_city": "PARIS"});
        assert_eq!(json_optional(&value, "clean_postal"), None);
        assert_eq!(json_optional(&value, "clean_city"), Some("PARIS".into()));
        assert_eq!(json_optional(&value, "missing"), None);
    }
}
