use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Alerts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAlert {
    pub timestamp: i64,
    pub severity: Severity,
    pub component: String,
    pub title: String,
    pub details: String,
}

// ── Caller identity ─────────────────────────────────────────────────────────

/// Account tier of the caller, as resolved by the surrounding service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Free,
    Pro,
    Internal,
}

impl Tier {
    /// Free tier is excluded from reputation scoring entirely.
    pub fn participates_in_reputation(&self) -> bool {
        matches!(self, Tier::Pro)
    }
}

/// Who is calling. The pipeline never sees raw credentials, only the
/// already-resolved tier and network address.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub address: Option<String>,
    pub tier: Tier,
    /// Raw value of the test-harness marker header, if the caller sent one.
    pub test_marker: Option<String>,
    /// Whether this account opted into auto-blocking flagged addresses.
    pub auto_block_enabled: bool,
}

impl Default for CallerContext {
    fn default() -> Self {
        Self {
            address: None,
            tier: Tier::Free,
            test_marker: None,
            auto_block_enabled: false,
        }
    }
}

// ── Request ─────────────────────────────────────────────────────────────────

/// Caller-supplied knobs for one validation run.
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Disable the literal-pattern battery (testing only).
    pub skip_patterns: bool,
    /// Disable the external-reference stage (testing only).
    pub skip_external_check: bool,
    /// Overall wall-clock budget. An exceeded deadline degrades the in-flight
    /// stage to that stage's documented fallback rather than failing the run.
    pub deadline: Option<Duration>,
}

/// One inbound validation request. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub text: String,
    pub session_token: Option<String>,
    pub caller: CallerContext,
    pub options: ValidationOptions,
}

impl ValidationRequest {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.into(),
            session_token: None,
            caller: CallerContext::default(),
            options: ValidationOptions::default(),
        }
    }

    pub fn with_session(mut self, token: &str) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_caller(mut self, caller: CallerContext) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_options(mut self, options: ValidationOptions) -> Self {
        self.options = options;
        self
    }
}

// ── Result ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Allow,
    AllowWithMonitoring,
    Block,
    BlockWithReview,
    ManualReview,
}

/// The only value returned to the caller. Always well-formed; there is no
/// exception-shaped failure mode across this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub safe: bool,
    pub confidence: f64,
    pub threats: Vec<String>,
    pub reasoning: String,
    pub stage: String,
    pub cost: f64,
    pub processing_time_ms: u64,
    pub recommendation: Option<Recommendation>,
    pub needs_review: bool,
    pub session_token: Option<String>,
}

// ── Stage labels ────────────────────────────────────────────────────────────

/// Stage tags reported in [`FinalResult::stage`]. These are part of the
/// public contract and are asserted on by callers.
pub mod stage {
    pub const XSS_PATTERN: &str = "xss_pattern";
    pub const SQL_PATTERN: &str = "sql_pattern";
    pub const TEMPLATE_PATTERN: &str = "template_pattern";
    pub const COMMAND_PATTERN: &str = "command_pattern";
    pub const SEMANTIC_PATTERN: &str = "semantic_pattern";
    pub const EXECUTION_PATTERN: &str = "execution_pattern";
    pub const JAILBREAK_PATTERN: &str = "jailbreak_pattern";
    pub const REPETITION_PATTERN: &str = "repetition_pattern";
    pub const EXTERNAL_REFERENCE: &str = "external_reference";
    pub const ORCHESTRATOR: &str = "orchestrator";
    pub const BUSINESS_OVERRIDE: &str = "business_override";
    pub const CONSENSUS_REVIEW: &str = "consensus_review";
    pub const ATTACK_DETECTED: &str = "attack_detected";
    pub const SEMANTIC_DETECTED: &str = "semantic_detected";
    pub const CONSENSUS_MAJORITY: &str = "consensus_majority";
    pub const CONSENSUS: &str = "consensus";
    pub const CONSENSUS_SAFE: &str = "consensus_safe";
    pub const PASS2: &str = "pass2";
    pub const PASS2_FALLBACK: &str = "pass2_fallback";
    pub const SESSION_GUARD: &str = "session_guard";
    pub const REPUTATION_GATE: &str = "reputation_gate";
}

/// Threat tags reported in [`FinalResult::threats`].
pub mod threat {
    pub const XSS_ATTACK: &str = "xss_attack";
    pub const SQL_INJECTION: &str = "sql_injection";
    pub const TEMPLATE_INJECTION: &str = "template_injection";
    pub const COMMAND_INJECTION: &str = "command_injection";
    pub const SEMANTIC_EXTRACTION: &str = "semantic_extraction";
    pub const EXECUTION_COMMAND: &str = "execution_command";
    pub const JAILBREAK_ATTEMPT: &str = "jailbreak_attempt";
    pub const FILTER_BYPASS: &str = "filter_bypass";
    pub const ENCODED_REFERENCE: &str = "encoded_reference";
    pub const OBFUSCATED_REFERENCE: &str = "obfuscated_reference";
    pub const SENSITIVE_FILE_REFERENCE: &str = "sensitive_file_reference";
    pub const EXTERNAL_REFERENCE_EXECUTION: &str = "external_reference_execution";
    pub const EXTERNAL_REFERENCE: &str = "external_reference";
    pub const ORCHESTRATOR_REJECT: &str = "orchestrator_reject";
    pub const CONTEXT_PRIMING: &str = "context_priming";
    pub const MULTI_TURN_ATTACK: &str = "multi_turn_attack";
    pub const KNOWN_BAD_ACTOR: &str = "known_bad_actor";
    pub const IP_REPUTATION: &str = "ip_reputation";
    pub const PROTOCOL_INTEGRITY_VIOLATION: &str = "protocol_integrity_violation";
    pub const PASS2_ERROR: &str = "pass2_error";
}
