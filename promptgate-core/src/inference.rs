//! Inference provider client — the trust boundary around external models.
//!
//! Every call sends a system-role instruction (never attacker-controlled) and
//! a user-role payload in which the untrusted text is embedded as an escaped,
//! labeled data field. The caller is responsible for weaving a fresh
//! [`crate::protocol::ProtocolToken`] into the system prompt and verifying the
//! echo on the way back; this module only moves bytes and accounts for cost.
//!
//! Model fallback: a call carries an ordered chain of models. Attempts walk
//! the chain until one returns a completion; token and schema verification
//! happen per attempt in the calling stage, so a fallback model gets no more
//! trust than the primary.

use crate::config::ModelSpec;
use crate::error::{GateError, GateResult};
use serde_json::{json, Value};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

/// One outbound classifier call.
#[derive(Debug, Clone)]
pub struct ChatCall {
    /// Stage label for logging and provider-side titling.
    pub label: &'static str,
    pub system_prompt: String,
    /// User-role payload; serialized as the JSON side channel carrying the
    /// untrusted input.
    pub payload: Value,
    /// Fallback chain, tried in order.
    pub models: Vec<ModelSpec>,
    pub timeout: Duration,
    pub max_tokens: u32,
}

/// A raw completion plus its accounting. Content is untrusted until the
/// calling stage protocol-checks it.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub elapsed_ms: u64,
}

/// Narrow seam over the external inference provider. Production uses
/// [`OpenRouterClient`]; tests script a mock.
pub trait InferenceProvider: Send + Sync {
    fn chat(&self, call: ChatCall) -> impl Future<Output = GateResult<ChatOutcome>> + Send;
}

/// Reqwest-backed client for an OpenRouter-compatible chat-completions API.
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    referer: String,
}

impl OpenRouterClient {
    pub fn new(api_key: &str, api_url: &str, referer: &str) -> GateResult<Self> {
        if api_key.trim().is_empty() {
            return Err(GateError::Config("inference API key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .user_agent("PromptGate/0.1")
            .build()
            .map_err(|e| GateError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.trim().to_string(),
            api_url: api_url.to_string(),
            referer: referer.to_string(),
        })
    }

    async fn attempt(&self, call: &ChatCall, model: &ModelSpec) -> GateResult<ChatOutcome> {
        let started = Instant::now();
        let body = json!({
            "model": model.name,
            "messages": [
                { "role": "system", "content": call.system_prompt },
                { "role": "user", "content": call.payload.to_string() },
            ],
            "temperature": 0,
            "max_tokens": call.max_tokens,
            "top_p": 1,
        });

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", format!("PromptGate {}", call.label))
            .timeout(call.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GateError::Timeout(call.timeout.as_millis() as u64)
                } else {
                    GateError::Inference(format!("{}: {e}", model.name))
                }
            })?;

        if !response.status().is_success() {
            return Err(GateError::Inference(format!(
                "{}: HTTP {}",
                model.name,
                response.status()
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| GateError::Inference(format!("{}: bad response body: {e}", model.name)))?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GateError::Inference(format!("{}: no content in response", model.name)))?
            .to_string();
        let tokens_used = data["usage"]["total_tokens"].as_u64().unwrap_or(0);

        Ok(ChatOutcome {
            content,
            model: model.name.clone(),
            tokens_used,
            cost: tokens_used as f64 * model.cost_per_million / 1_000_000.0,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl InferenceProvider for OpenRouterClient {
    async fn chat(&self, call: ChatCall) -> GateResult<ChatOutcome> {
        let mut last_error = GateError::Inference("no models configured".into());
        for model in &call.models {
            match self.attempt(&call, model).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(stage = call.label, model = %model.name, error = %e, "model attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
