//! ==============================================================================
//! insight.rs - derived text insight over the latest snapshot
//! ==============================================================================
//!
//! purpose:
//!     turns a complete snapshot into a short natural-language recommendation
//!     by asking an external text-generation service, and only reports the
//!     result when the text actually changed. sensors tick every few seconds,
//!     meaningful insight changes are rare; exact-equality change detection is
//!     the only rate limiter.
//!
//!     incomplete snapshot -> fixed "not enough data" text
//!     generation error    -> fixed failure text carrying the cause
//!     both go through the same change detection as real insights.
//!
//! concurrency:
//!     the generation call is slow and runs outside the ingestion path (see
//!     relay.rs). results are surfaced in completion order: whichever call
//!     finishes last wins, even if it was started from an older snapshot.
//!
//! relationships:
//!     - used by: relay.rs, fanout.rs (InsightCell for replay)
//!     - uses: reqwest (Gemini generateContent endpoint)
//!
//! ==============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Fault;
use crate::reading::{SensorKind, Snapshot};

pub const INITIAL_INSIGHT: &str = "Receiving insights...";
pub const INSUFFICIENT_DATA: &str =
    "Not enough data for a comprehensive insight yet. Awaiting all sensor readings.";

/// The last surfaced insight. `seq` bumps on every change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Insight {
    #[serde(rename = "insight")]
    pub text: String,
    #[serde(skip)]
    pub seq: u64,
}

/// Shared handle on the current insight; the engine writes, the hub reads.
#[derive(Clone)]
pub struct InsightCell(Arc<RwLock<Insight>>);

impl Default for InsightCell {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(Insight { text: INITIAL_INSIGHT.to_string(), seq: 0 })))
    }
}

impl InsightCell {
    pub async fn get(&self) -> Insight {
        self.0.read().await.clone()
    }

    /// Store `text` if it differs from the current one.
    async fn replace_if_changed(&self, text: String) -> (Insight, bool) {
        let mut current = self.0.write().await;
        if current.text == text {
            return (current.clone(), false);
        }
        current.text = text;
        current.seq += 1;
        (current.clone(), true)
    }
}

// ==============================================================================
// generation capability
// ==============================================================================

pub trait InsightGenerator: Send + Sync + 'static {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, Fault>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Google Gemini `generateContent` over HTTPS.
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl GeminiGenerator {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Result<Self, Fault> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Fault::Config(format!("http client: {}", e)))?;
        Ok(Self { client, api_url: api_url.to_string(), api_key: api_key.to_string() })
    }

    // the key goes in a header so it never shows up in a url
    fn request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let body = GenerateRequest {
            contents: vec![Content { role: "user", parts: vec![Part { text: prompt }] }],
            generation_config: GenerationConfig { temperature: 0.7, top_p: 0.95, top_k: 40, max_output_tokens: 150 },
        };
        let request = self.client.post(&self.api_url).json(&body);
        if self.api_key.is_empty() {
            return request;
        }
        request.header(API_KEY_HEADER, self.api_key.as_str())
    }
}

impl InsightGenerator for GeminiGenerator {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, Fault>> + Send {
        let request = self.request(prompt);

        async move {
            let response = request.send().await?.error_for_status()?;
            let parsed: GenerateResponse = response
                .json()
                .await
                .map_err(|e| Fault::Upstream(format!("Invalid JSON response ({}).", e.without_url())))?;
            match parsed.first_text() {
                Some(text) => Ok(text.to_string()),
                None => Err(Fault::Upstream("Unexpected API response structure.".to_string())),
            }
        }
    }
}

// ==============================================================================
// engine
// ==============================================================================

pub struct InsightEngine<G> {
    generator: G,
    cell: InsightCell,
    timeout: Duration,
}

impl<G: InsightGenerator> InsightEngine<G> {
    pub fn new(generator: G, cell: InsightCell, timeout: Duration) -> Self {
        Self { generator, cell, timeout }
    }

    pub fn cell(&self) -> &InsightCell {
        &self.cell
    }

    /// Evaluate `snapshot` and surface the result; `changed` is false when
    /// the text equals the last surfaced insight.
    pub async fn maybe_regenerate(&self, snapshot: &Snapshot) -> (Insight, bool) {
        let text = self.evaluate(snapshot).await;
        let (insight, changed) = self.cell.replace_if_changed(text).await;
        if changed {
            tracing::info!(insight = %insight.text, "insight changed");
        } else {
            tracing::debug!("insight unchanged");
        }
        (insight, changed)
    }

    async fn evaluate(&self, snapshot: &Snapshot) -> String {
        if !snapshot.is_complete() {
            return INSUFFICIENT_DATA.to_string();
        }

        let prompt = build_prompt(snapshot);
        let outcome = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
            Ok(result) => result,
            Err(_) => Err(Fault::Upstream(format!("API call error (timed out after {:?}).", self.timeout))),
        };

        match outcome {
            Ok(text) => text,
            Err(fault) => {
                tracing::warn!(error = %fault, "insight generation failed");
                format!("Failed to generate AI insight: {}", fault.cause())
            }
        }
    }
}

/// Request text for the generation service.
pub fn build_prompt(snapshot: &Snapshot) -> String {
    let mut readings = String::new();
    for kind in SensorKind::ALL {
        let label = match kind {
            SensorKind::Temperature => "Temperature",
            SensorKind::Humidity => "Humidity",
            SensorKind::Voltage => "Voltage",
            SensorKind::Current => "Current",
            SensorKind::Power => "Power",
        };
        readings.push_str(&format!("- {}: {}\n", label, snapshot.get(kind)));
    }

    format!(
        "You are an agricultural assistant watching a small wind turbine that powers a growing area. \
Give one concise, actionable insight or recommendation based on the readings below, focusing on \
plant health, energy efficiency or system maintenance.\n\n\
Current readings:\n{}\n\
Healthy growing conditions are 50-70% relative humidity and 20-28°C. If a value falls outside \
those bands, name a specific corrective action. If the power readings look unusually low or high, \
comment on energy efficiency or the health of the generator.\n\n\
Reply with the insight text only.",
        readings
    )
}
