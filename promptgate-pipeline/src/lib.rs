//! PromptGate — multi-stage validation and consensus pipeline for untrusted
//! text heading into AI-backed applications.
//!
//! Cheap and fast for the common case, progressively more thorough for
//! ambiguous input:
//!
//! 1. [`reputation`] — pre-filter priority chain (markers, lists, tiers,
//!    reputation scores)
//! 2. [`session`] — multi-turn context-priming guard
//! 3. [`patterns`] — zero-cost signature battery
//! 4. [`external_reference`] — URL/IP/path/obfuscation screening
//! 5. [`orchestrator`] — one cheap routing call
//! 6. [`validators`] — business / attack / semantic classifiers in parallel
//! 7. [`consensus`] — deterministic verdict cascade
//! 8. [`deep_analysis`] — the expensive final arbiter, only when needed
//!
//! [`pipeline::ValidationPipeline`] wires the stages together behind a
//! single `validate` operation that always returns a well-formed
//! [`types::FinalResult`].

pub mod consensus;
pub mod deep_analysis;
pub mod external_reference;
pub mod orchestrator;
pub mod patterns;
pub mod pipeline;
pub mod reputation;
pub mod session;
pub mod types;
pub mod validators;

#[cfg(test)]
mod tests;

pub use pipeline::{DefaultPipeline, ValidationPipeline};
pub use types::{
    CallerContext, FinalResult, Recommendation, Tier, ValidationOptions, ValidationRequest,
};
