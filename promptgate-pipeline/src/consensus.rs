//! Consensus engine — deterministic aggregation of Pass-1 signals.
//!
//! A pure function with no external calls: given the orchestrator's routing
//! decision and whichever validator verdicts actually ran, produce a
//! tri-state verdict (`safe`, `blocked`, or `undetermined, escalate`).
//!
//! The cascade is represented as an ordered list of named predicate→verdict
//! rules evaluated top-down with early return. THE ORDERING IS LOAD-BEARING:
//! rule 3 must shadow rule 4 for the borderline business/attack band, and
//! the attack band in rule 7 must be unreachable for anything rule 4 already
//! blocked. Do not reorder.
//!
//! Confidence reporting is deliberately asymmetric: a safe verdict carries
//! the mean of the contributing validators, while any attack-flavored
//! verdict carries the maximum among attack-relevant signals. A strong
//! attack signal must never be diluted by weak bystander confidences.

use crate::orchestrator::RoutingDecision;
use crate::types::{stage, threat};
use crate::validators::{AttackVerdict, BusinessVerdict, SemanticVerdict};

// Cascade thresholds. Fixed by contract, not configuration: callers audit
// decisions against these exact numbers.
pub const FAST_REJECT_CONFIDENCE: f64 = 0.85;
pub const BUSINESS_OVERRIDE: f64 = 0.8;
pub const ATTACK_SOFT_FLOOR: f64 = 0.6;
pub const ATTACK_REVIEW_CEILING: f64 = 0.7;
pub const ATTACK_BLOCK: f64 = 0.75;
pub const SEMANTIC_BLOCK: f64 = 0.7;
pub const MAJORITY_CONFIDENCE: f64 = 0.7;
pub const AGGREGATE_FLOOR: f64 = 0.6;
pub const ATTACK_BAND_LOW: f64 = 0.5;
pub const ATTACK_BAND_HIGH: f64 = 0.85;

/// Everything the cascade may read. Absent validators did not run.
pub struct ConsensusInput<'a> {
    pub routing: &'a RoutingDecision,
    pub business: Option<&'a BusinessVerdict>,
    pub attack: Option<&'a AttackVerdict>,
    pub semantic: Option<&'a SemanticVerdict>,
}

/// Produced once per request; never mutated afterward. The deep-analysis
/// pass builds a fresh result that may reference but does not edit this.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusVerdict {
    /// `None` means undetermined: Pass 2 must decide.
    pub safe: Option<bool>,
    pub confidence: f64,
    pub threats: Vec<String>,
    pub reasoning: String,
    pub stage: &'static str,
    pub needs_pass2: bool,
    pub needs_review: bool,
}

/// One step of the cascade. `eval` returns `Some` to terminate.
pub struct ConsensusRule {
    pub name: &'static str,
    pub eval: fn(&ConsensusInput) -> Option<ConsensusVerdict>,
}

/// The cascade, in evaluation order.
pub const CONSENSUS_RULES: &[ConsensusRule] = &[
    ConsensusRule { name: "orchestrator_fast_reject", eval: rule_fast_reject },
    ConsensusRule { name: "business_override", eval: rule_business_override },
    ConsensusRule { name: "business_attack_borderline", eval: rule_business_attack_borderline },
    ConsensusRule { name: "attack_block", eval: rule_attack_block },
    ConsensusRule { name: "semantic_block", eval: rule_semantic_block },
    ConsensusRule { name: "validator_majority_safe", eval: rule_validator_majority },
    ConsensusRule { name: "attack_band_escalate", eval: rule_attack_band },
    ConsensusRule { name: "weak_aggregate_escalate", eval: rule_weak_aggregate },
    ConsensusRule { name: "default_safe", eval: rule_default_safe },
];

/// Evaluate the cascade. The final rule is total, so this always yields a
/// verdict; the closing default mirrors it for belt-and-braces.
pub fn build_consensus(input: &ConsensusInput) -> ConsensusVerdict {
    CONSENSUS_RULES
        .iter()
        .find_map(|rule| (rule.eval)(input))
        .unwrap_or_else(|| default_safe(input))
}

// ── Rules ───────────────────────────────────────────────────────────────────

fn rule_fast_reject(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let routing = input.routing;
    if routing.fast_reject && routing.confidence > FAST_REJECT_CONFIDENCE {
        return Some(ConsensusVerdict {
            safe: Some(false),
            confidence: routing.confidence,
            threats: vec![threat::ORCHESTRATOR_REJECT.into()],
            reasoning: format!("Orchestrator rejected: {}", routing.reasoning),
            stage: stage::ORCHESTRATOR,
            needs_pass2: false,
            needs_review: false,
        });
    }
    None
}

fn rule_business_override(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let business = input.business.filter(|b| b.is_business && b.confidence > BUSINESS_OVERRIDE)?;
    let attack_cleared = match input.attack {
        Some(attack) if attack.is_attack => attack.confidence < ATTACK_SOFT_FLOOR,
        _ => true,
    };
    if attack_cleared {
        return Some(ConsensusVerdict {
            safe: Some(true),
            confidence: business.confidence,
            threats: vec![],
            reasoning: format!("Legitimate business context: {}", business.signals.join(", ")),
            stage: stage::BUSINESS_OVERRIDE,
            needs_pass2: false,
            needs_review: false,
        });
    }
    None
}

/// Strong business signal colliding with a borderline attack signal:
/// escalate, don't silently override either side.
fn rule_business_attack_borderline(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let business = input.business.filter(|b| b.is_business && b.confidence > BUSINESS_OVERRIDE)?;
    let attack = input.attack.filter(|a| {
        a.is_attack && a.confidence >= ATTACK_SOFT_FLOOR && a.confidence < ATTACK_REVIEW_CEILING
    })?;
    Some(ConsensusVerdict {
        safe: Some(false),
        confidence: business.confidence.max(attack.confidence),
        threats: attack.attack_types.clone(),
        reasoning: format!(
            "Borderline conflict: business confidence {:.2} against attack confidence {:.2}",
            business.confidence, attack.confidence
        ),
        stage: stage::CONSENSUS_REVIEW,
        needs_pass2: true,
        needs_review: true,
    })
}

fn rule_attack_block(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let attack = input.attack.filter(|a| a.is_attack && a.confidence > ATTACK_BLOCK)?;
    let threats = if attack.attack_types.is_empty() {
        vec!["ai_manipulation".into()]
    } else {
        attack.attack_types.clone()
    };
    Some(ConsensusVerdict {
        safe: Some(false),
        confidence: attack.confidence,
        threats,
        reasoning: format!("Attack detected: {}", attack.reasoning),
        stage: stage::ATTACK_DETECTED,
        needs_pass2: false,
        needs_review: false,
    })
}

fn rule_semantic_block(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let semantic = input
        .semantic
        .filter(|s| s.is_semantic_attack && s.confidence > SEMANTIC_BLOCK)?;
    Some(ConsensusVerdict {
        safe: Some(false),
        confidence: semantic.confidence,
        threats: vec![threat::SEMANTIC_EXTRACTION.into()],
        reasoning: format!("Semantic extraction attempt: {}", semantic.extraction_method),
        stage: stage::SEMANTIC_DETECTED,
        needs_pass2: false,
        needs_review: false,
    })
}

/// Two or more confident validators agreeing there is no attack is a
/// stronger safety signal than any single one.
fn rule_validator_majority(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let mut confident = Vec::new();
    let mut attack_votes = 0usize;
    let mut clear_votes = 0usize;

    if let Some(business) = input.business {
        if business.confidence > MAJORITY_CONFIDENCE {
            confident.push(business.confidence);
        }
        if business.is_business {
            clear_votes += 1;
        }
    }
    if let Some(attack) = input.attack {
        if attack.confidence > MAJORITY_CONFIDENCE {
            confident.push(attack.confidence);
        }
        if attack.is_attack {
            attack_votes += 1;
        } else {
            clear_votes += 1;
        }
    }
    if let Some(semantic) = input.semantic {
        if semantic.confidence > MAJORITY_CONFIDENCE {
            confident.push(semantic.confidence);
        }
        if semantic.is_semantic_attack {
            attack_votes += 1;
        } else {
            clear_votes += 1;
        }
    }

    if confident.len() >= 2 && clear_votes > attack_votes {
        let mean = confident.iter().sum::<f64>() / confident.len() as f64;
        return Some(ConsensusVerdict {
            safe: Some(true),
            confidence: mean,
            threats: vec![],
            reasoning: "Validator majority agrees: no attack".into(),
            stage: stage::CONSENSUS_MAJORITY,
            needs_pass2: false,
            needs_review: false,
        });
    }
    None
}

fn rule_attack_band(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let attack = input.attack.filter(|a| {
        a.is_attack && a.confidence > ATTACK_BAND_LOW && a.confidence < ATTACK_BAND_HIGH
    })?;
    let needs_review =
        attack.confidence >= ATTACK_SOFT_FLOOR && attack.confidence < ATTACK_REVIEW_CEILING;
    Some(ConsensusVerdict {
        safe: None,
        confidence: attack.confidence,
        threats: attack.attack_types.clone(),
        reasoning: "Medium-confidence attack signal, escalating to deep analysis".into(),
        stage: stage::CONSENSUS,
        needs_pass2: true,
        needs_review,
    })
}

fn rule_weak_aggregate(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    let aggregate = aggregate_confidence(input);
    if aggregate < AGGREGATE_FLOOR {
        return Some(ConsensusVerdict {
            safe: None,
            confidence: aggregate,
            threats: vec![],
            reasoning: "Low aggregate confidence, escalating to deep analysis".into(),
            stage: stage::CONSENSUS,
            needs_pass2: true,
            needs_review: false,
        });
    }
    None
}

fn rule_default_safe(input: &ConsensusInput) -> Option<ConsensusVerdict> {
    Some(default_safe(input))
}

fn default_safe(input: &ConsensusInput) -> ConsensusVerdict {
    ConsensusVerdict {
        safe: Some(true),
        confidence: mean_confidence(input),
        threats: vec![],
        reasoning: "No attacks detected by validators".into(),
        stage: stage::CONSENSUS_SAFE,
        needs_pass2: false,
        needs_review: false,
    }
}

// ── Aggregation helpers ─────────────────────────────────────────────────────

fn ran_confidences(input: &ConsensusInput) -> Vec<f64> {
    let mut confidences = Vec::with_capacity(3);
    if let Some(business) = input.business {
        confidences.push(business.confidence);
    }
    if let Some(attack) = input.attack {
        confidences.push(attack.confidence);
    }
    if let Some(semantic) = input.semantic {
        confidences.push(semantic.confidence);
    }
    confidences
}

fn mean_confidence(input: &ConsensusInput) -> f64 {
    let confidences = ran_confidences(input);
    if confidences.is_empty() {
        0.5
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    }
}

/// Mean of the validators that ran, EXCEPT when any attack or semantic
/// signal is present: then the maximum wins, so one strong signal cannot be
/// averaged away by weak bystanders.
fn aggregate_confidence(input: &ConsensusInput) -> f64 {
    let confidences = ran_confidences(input);
    if confidences.is_empty() {
        return 0.5;
    }
    let attack_signal = input.attack.map(|a| a.is_attack).unwrap_or(false)
        || input.semantic.map(|s| s.is_semantic_attack).unwrap_or(false);
    if attack_signal {
        confidences.iter().copied().fold(0.0, f64::max)
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    }
}
