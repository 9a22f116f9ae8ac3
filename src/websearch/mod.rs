//! Web-search branch for suppliers outside the national registry. A remote
//! model with search grounding returns contact details; every failure is
//! folded into an ERROR row so the unified report still covers the id.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;

use crate::oracle::API_KEY_VAR;
use crate::pipeline::{write_report, CancelFlag, ReportRow, SupplierRow, SupplierTable};

#[derive(Error, Debug)]
pub enum WebSearchError {
    #[error("credential variable {0} is not set")]
    MissingCredential(&'static str),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("malformed search response: {0}")]
    MalformedResponse(String),

    #[error("report error: {0}")]
    ReportError(#[from] crate::pipeline::PipelineError),
}

pub type Result<T> = std::result::Result<T, WebSearchError>;

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_WEBSEARCH_WORKERS: usize = 10;

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// What the search found for one supplier.
#[derive(Debug, Clone)]
pub struct WebSearchResult {
    pub input_id: String,
    pub company_name: String,
    pub country: String,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub found_website: Option<String>,
    pub found_address: Option<String>,
    pub found_phone: Option<String>,
    pub found_email: Option<String>,
    pub confidence_score: f64,
    pub search_method: String,
    pub error: Option<String>,
}

impl WebSearchResult {
    pub fn to_report_row(&self) -> ReportRow {
        ReportRow {
            input_id: self.input_id.clone(),
            resolved_siret: String::new(),
            official_name: self.company_name.clone(),
            confidence_score: format!("{:?}", self.confidence_score),
            match_method: self.search_method.clone(),
            alternatives: String::new(),
            found_website: self.found_website.clone().unwrap_or_default(),
            found_address: self.found_address.clone().unwrap_or_default(),
            found_phone: self.found_phone.clone().unwrap_or_default(),
            found_email: self.found_email.clone().unwrap_or_default(),
            country: self.country.clone(),
            city: self.city.clone().unwrap_or_default(),
            postal_code: self.postal_code.clone().unwrap_or_default(),
            search_method: self.search_method.clone(),
            error: self.error.clone().unwrap_or_default(),
        }
    }
}

/// Memoizing search provider, one instance per worker.
pub struct WebSearchProvider {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    endpoint: String,
    cache: HashMap<String, WebSearchResult>,
}

impl WebSearchProvider {
    pub fn from_env(timeout_secs: u64) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(WebSearchError::MissingCredential(API_KEY_VAR))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("sirene-rs/0.1.0")
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            cache: HashMap::new(),
        })
    }

    pub fn search_supplier(&mut self, raw: &SupplierRow) -> WebSearchResult {
        let cache_key = format!(
            "{}|{}|{}|{}",
            raw.text("Nom"),
            raw.text("Ville"),
            raw.text("Postal"),
            raw.text("Pays"),
        );
        if let Some(cached) = self.cache.get(&cache_key) {
            return cached.clone();
        }

        let input_id = raw.input_id();
        let company_name = raw.text("Nom").trim().to_string();
        let country = {
            let c = raw.text("Pays").trim().to_string();
            if c.is_empty() {
                "UNKNOWN".to_string()
            } else {
                c
            }
        };
        let city = non_blank(raw.text("Ville"));
        let postal_code = non_blank(raw.text("Postal"));

        let result = if company_name.is_empty() {
            WebSearchResult {
                input_id,
                company_name,
                country,
                city,
                postal_code,
                found_website: None,
                found_address: None,
                found_phone: None,
                found_email: None,
                confidence_score: 0.0,
                search_method: "NO_NAME".to_string(),
                error: None,
            }
        } else {
            match self.search_remote(&company_name, &country, city.as_deref(), postal_code.as_deref())
            {
                Ok(data) => WebSearchResult {
                    input_id,
                    company_name,
                    country,
                    city,
                    postal_code,
                    found_website: json_optional(&data, "website"),
                    found_address: json_optional(&data, "address"),
                    found_phone: json_optional(&data, "phone"),
                    found_email: json_optional(&data, "email"),
                    confidence_score: data["confidence"].as_f64().unwrap_or(0.0),
                    search_method: "WEB_SEARCH".to_string(),
                    error: None,
                },
                Err(err) => {
                    tracing::warn!("web search failed for '{company_name}': {err}");
                    WebSearchResult {
                        input_id,
                        company_name,
                        country,
                        city,
                        postal_code,
                        found_website: None,
                        found_address: None,
                        found_phone: None,
                        found_email: None,
                        confidence_score: 0.0,
                        search_method: "ERROR".to_string(),
                        error: Some(err.to_string()),
                    }
                }
            }
        };

        self.cache.insert(cache_key, result.clone());
        result
    }

    fn search_remote(
        &self,
        company_name: &str,
        country: &str,
        city: Option<&str>,
        postal_code: Option<&str>,
    ) -> Result<Value> {
        let mut search_query = company_name.to_string();
        if let Some(city) = city {
            search_query.push(' ');
            search_query.push_str(city);
        }
        if country != "UNKNOWN" {
            search_query.push(' ');
            search_query.push_str(country);
        }
        let prompt = format!(
            "You are a business information researcher. Search for information about this \
             company and return structured data.\n\n\
             Company: {company_name}\n\
             Location: {}, {country}\n\
             Postal Code: {}\n\n\
             Task: Find the official website, address, phone number, and email for this company.\n\n\
             Return JSON with these keys:\n\
             - website: Official company website URL (or null)\n\
             - address: Full business address (or null)\n\
             - phone: Phone number (or null)\n\
             - email: Contact email (or null)\n\
             - confidence: Float 0.0-1.0 indicating how confident you are this is the correct company\n\n\
             Search query: \"{search_query}\"\n\n\
             Return ONLY the JSON object (no markdown, no explanation).",
            city.unwrap_or("Unknown"),
            postal_code.unwrap_or("Unknown"),
        );

        let url = format!(
            "{}/models/{}:generateContent",
            self.endpoint, self.model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "tools": [{ "google_search": {} }]
        });
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()?
            .error_for_status()?;
        let value: Value = response.json()?;
        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| WebSearchError::MalformedResponse("no text part in response".into()))?;
        let raw = JSON_OBJECT
            .find(text)
            .ok_or_else(|| WebSearchError::MalformedResponse("no JSON object in response".into()))?;
        serde_json::from_str(raw.as_str())
            .map_err(|e| WebSearchError::MalformedResponse(format!("invalid JSON: {e}")))
    }
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_optional(value: &Value, key: &str) -> Option<String> {
    value[key].as_str().map(str::trim).and_then(|s| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    })
}

/// Fan the non-domestic rows out over a small worker pool and write one
/// unified-schema CSV. Returns the number of rows written.
pub fn run_websearch(
    table: &SupplierTable,
    output_csv: &Path,
    num_workers: usize,
    rate_limit_delay: f64,
    timeout_secs: u64,
    cancel: &CancelFlag,
) -> Result<usize> {
    // Validate credentials once before spawning workers.
    drop(WebSearchProvider::from_env(timeout_secs)?);

    let total = table.rows.len();
    if total == 0 {
        write_report(&[], output_csv)?;
        return Ok(0);
    }
    let num_workers = num_workers.clamp(1, total);
    tracing::info!("searching {total} suppliers with {num_workers} workers");

    let (task_tx, task_rx) = bounded::<SupplierRow>(num_workers * 2);
    let (out_tx, out_rx) = unbounded::<ReportRow>();

    let mut workers = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let task_rx = task_rx.clone();
        let out_tx = out_tx.clone();
        let cancel = cancel.clone();
        workers.push(std::thread::spawn(move || {
            let mut provider = match WebSearchProvider::from_env(timeout_secs) {
                Ok(provider) => provider,
                Err(err) => {
                    tracing::error!("web search worker failed to start: {err}");
                    return;
                }
            };
            while let Ok(raw) = task_rx.recv() {
                if cancel.is_cancelled() {
                    break;
                }
                let row = provider.search_supplier(&raw).to_report_row();
                if out_tx.send(row).is_err() {
                    break;
                }
            }
        }));
    }
    drop(task_rx);
    drop(out_tx);

    let submit_delay = (rate_limit_delay > 0.0)
        .then(|| Duration::from_secs_f64(rate_limit_delay / num_workers as f64));
    let dispatch_cancel = cancel.clone();
    let rows = table.rows.clone();
    let dispatcher = std::thread::spawn(move || {
        for row in rows {
            if dispatch_cancel.is_cancelled() {
                break;
            }
            if let Some(delay) = submit_delay {
                std::thread::sleep(delay);
            }
            if task_tx.send(row).is_err() {
                break;
            }
        }
    });

    let started = Instant::now();
    let mut results = Vec::with_capacity(total);
    loop {
        match out_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(row) => {
                results.push(row);
                let done = results.len();
                if done % 10 == 0 || done == total {
                    let elapsed = started.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
                    tracing::info!("web search progress: {done}/{total} | rate={rate:.1}/s");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = dispatcher.join();
    for worker in workers {
        let _ = worker.join();
    }

    write_report(&results, output_csv)?;
    tracing::info!("saved {} web search results to {}", results.len(), output_csv.display());
    Ok(results.len())
}
