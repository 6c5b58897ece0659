use serde::{Deserialize, Serialize};

/// A single model in a fallback chain. Chains are tried in order; the first
/// model that returns a verifiable response wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// USD per million tokens, used for per-request cost accounting.
    pub cost_per_million: f64,
}

impl ModelSpec {
    pub fn new(name: &str, cost_per_million: f64) -> Self {
        Self { name: name.into(), cost_per_million }
    }
}

/// Global configuration for the validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// API key for the inference provider. The one fatal-at-startup setting.
    pub api_key: String,
    /// Chat-completions endpoint (OpenRouter-compatible).
    pub api_url: String,
    /// Referer/title headers sent with every provider call.
    pub referer: String,
    pub models: ModelChains,
    pub timeouts: StageTimeouts,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChains {
    pub orchestrator: Vec<ModelSpec>,
    pub business: Vec<ModelSpec>,
    pub attack: Vec<ModelSpec>,
    pub semantic: Vec<ModelSpec>,
    pub deep_analysis: Vec<ModelSpec>,
}

impl Default for ModelChains {
    fn default() -> Self {
        Self {
            orchestrator: vec![ModelSpec::new("meta-llama/llama-3.1-8b-instruct", 0.055)],
            business: vec![ModelSpec::new("meta-llama/llama-3.2-1b-instruct", 0.001)],
            attack: vec![ModelSpec::new("meta-llama/llama-3.1-8b-instruct", 0.055)],
            semantic: vec![ModelSpec::new("meta-llama/llama-3.1-8b-instruct", 0.02)],
            deep_analysis: vec![
                ModelSpec::new("meta-llama/llama-3.1-70b-instruct", 0.05),
                ModelSpec::new("google/gemini-2.0-flash-exp:free", 0.0),
            ],
        }
    }
}

/// Per-stage call timeouts in milliseconds. Short for the cheap classifiers,
/// longer for the deep-analysis call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub orchestrator_ms: u64,
    pub business_ms: u64,
    pub attack_ms: u64,
    pub semantic_ms: u64,
    pub deep_analysis_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            orchestrator_ms: 3_000,
            business_ms: 2_000,
            attack_ms: 3_000,
            semantic_ms: 3_000,
            deep_analysis_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Absolute session TTL in seconds (2 hours).
    pub ttl_secs: i64,
    /// Maximum retained turns per session; oldest evicted first.
    pub history_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 7_200, history_cap: 50 }
    }
}

impl GateConfig {
    /// Build a config from the environment. A missing API key is a fatal
    /// configuration error: the process should refuse to start rather than
    /// degrade every request at runtime.
    pub fn from_env() -> Result<Self, crate::error::GateError> {
        let api_key = std::env::var("PROMPTGATE_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                crate::error::GateError::Config(
                    "PROMPTGATE_API_KEY environment variable not set".into(),
                )
            })?;
        let api_url = std::env::var("PROMPTGATE_API_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".into());

        Ok(Self {
            api_key,
            api_url,
            referer: "https://promptgate.dev".into(),
            models: ModelChains::default(),
            timeouts: StageTimeouts::default(),
            session: SessionConfig::default(),
        })
    }

    /// Config for tests and offline use: provider calls are expected to be
    /// served by a mock, so the key is a placeholder.
    pub fn for_testing() -> Self {
        Self {
            api_key: "test-key".into(),
            api_url: "http://localhost:0/unused".into(),
            referer: "https://promptgate.dev".into(),
            models: ModelChains::default(),
            timeouts: StageTimeouts::default(),
            session: SessionConfig::default(),
        }
    }
}
