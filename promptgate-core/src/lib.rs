//! PromptGate core — shared plumbing for the validation pipeline.
//!
//! Provides the pieces every stage leans on:
//! - [`error`] — the error taxonomy; classifier failures are recovered
//!   locally by each stage, only configuration errors are fatal
//! - [`config`] — model chains, thresholds, timeouts
//! - [`protocol`] — per-call nonces and strict response verification
//! - [`inference`] — the provider client with model fallback
//! - [`accounting`] — cost and parallel-aware latency ledgers

pub mod accounting;
pub mod config;
pub mod error;
pub mod inference;
pub mod protocol;

pub use accounting::CostLedger;
pub use config::{GateConfig, ModelSpec};
pub use error::{GateError, GateResult};
pub use inference::{ChatCall, ChatOutcome, InferenceProvider, OpenRouterClient};
pub use protocol::{
    extract_json, sanitize_untrusted, verify_response, FieldKind, FieldSpec, ProtocolToken,
    ProtocolViolation,
};
