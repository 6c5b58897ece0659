//! Validation pipeline — the short-circuiting stage machine.
//!
//! Control flow per request:
//!
//! Reputation Gate → Session Guard → Pattern Battery → External Reference →
//! Orchestrator → Validators (parallel) → Consensus → \[terminal\] or
//! Deep-Analysis → terminal result.
//!
//! Every stage can end the run; the validator fan-out is the only parallel
//! section, and its wall-clock charge is the slowest member, not the sum.
//! The caller always receives a well-formed [`FinalResult`]: each external
//! stage recovers locally via its documented fallback, and a caller-supplied
//! deadline degrades the in-flight stage to that same fallback instead of
//! failing the request.

use crate::consensus::{self, build_consensus, ConsensusInput};
use crate::deep_analysis;
use crate::external_reference::{self, HeuristicReferenceClassifier, ReferenceClassifier};
use crate::orchestrator::{self, RoutingDecision};
use crate::patterns::{PatternBattery, PatternScreen};
use crate::reputation::{InMemoryReputationStore, ReputationGate, ReputationStore};
use crate::session::{InMemorySessionStore, SessionGuard, SessionStore};
use crate::types::{stage, threat, FinalResult, GateAlert, Severity, ValidationRequest};
use crate::validators::{
    analyze_semantic, detect_attack, validate_business, AttackVerdict, BusinessVerdict,
    SemanticVerdict,
};
use parking_lot::RwLock;
use promptgate_core::{CostLedger, GateConfig, GateResult, InferenceProvider, OpenRouterClient};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_ALERTS: usize = 5_000;

/// The pipeline with the default provider and in-memory stores.
pub type DefaultPipeline = ValidationPipeline<OpenRouterClient, InMemoryReputationStore, InMemorySessionStore>;

pub struct ValidationPipeline<P, R, S>
where
    P: InferenceProvider,
    R: ReputationStore,
    S: SessionStore,
{
    config: GateConfig,
    provider: P,
    battery: PatternBattery,
    references: Box<dyn ReferenceClassifier>,
    gate: ReputationGate<R>,
    sessions: SessionGuard<S>,

    total_validated: AtomicU64,
    total_blocked: AtomicU64,
    total_pass2: AtomicU64,
    total_protocol_violations: AtomicU64,
    alerts: RwLock<Vec<GateAlert>>,
}

impl DefaultPipeline {
    /// Build the production pipeline from the environment. Fails only on
    /// configuration errors; everything else degrades per stage at runtime.
    pub fn from_env() -> GateResult<Self> {
        let config = GateConfig::from_env()?;
        let provider = OpenRouterClient::new(&config.api_key, &config.api_url, &config.referer)?;
        let ttl_secs = config.session.ttl_secs;
        Ok(Self::new(
            config,
            provider,
            InMemoryReputationStore::new(),
            InMemorySessionStore::new(ttl_secs),
        ))
    }
}

impl<P, R, S> ValidationPipeline<P, R, S>
where
    P: InferenceProvider,
    R: ReputationStore,
    S: SessionStore,
{
    pub fn new(config: GateConfig, provider: P, reputation_store: R, session_store: S) -> Self {
        let history_cap = config.session.history_cap;
        Self {
            config,
            provider,
            battery: PatternBattery::new(),
            references: Box::new(HeuristicReferenceClassifier::new()),
            gate: ReputationGate::new(reputation_store),
            sessions: SessionGuard::new(session_store, history_cap),
            total_validated: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            total_pass2: AtomicU64::new(0),
            total_protocol_violations: AtomicU64::new(0),
            alerts: RwLock::new(Vec::new()),
        }
    }

    /// Swap in an external reference classifier implementation.
    pub fn with_reference_classifier(mut self, classifier: Box<dyn ReferenceClassifier>) -> Self {
        self.references = classifier;
        self
    }

    pub fn reputation_gate(&self) -> &ReputationGate<R> {
        &self.gate
    }

    pub fn session_guard(&self) -> &SessionGuard<S> {
        &self.sessions
    }

    /// The single inbound operation. Always returns a well-formed result.
    pub async fn validate(&self, request: ValidationRequest) -> FinalResult {
        let started = Instant::now();
        self.total_validated.fetch_add(1, Ordering::Relaxed);

        // Reputation gate: the only stage allowed to run before session
        // resolution, so blocked actors never mint sessions.
        let gate_decision = self.gate.evaluate(&request.caller);
        if !gate_decision.allowed {
            self.note_block(stage::REPUTATION_GATE, gate_decision.block_reason.unwrap_or(""));
            return FinalResult {
                safe: false,
                confidence: 1.0,
                threats: vec![threat::KNOWN_BAD_ACTOR.into(), threat::IP_REPUTATION.into()],
                reasoning: format!(
                    "Request blocked by reputation gate ({}, score {:.2})",
                    gate_decision.block_reason.unwrap_or("flagged"),
                    gate_decision.score
                ),
                stage: stage::REPUTATION_GATE.into(),
                cost: 0.0,
                processing_time_ms: 0,
                recommendation: None,
                needs_review: false,
                session_token: None,
            };
        }

        // Session guard: resolve (or mint) the session and run the
        // context-priming check against prior turns.
        let (session_token, prior_turns) = self.sessions.resolve(request.session_token.as_deref());

        let mut result = match self.sessions.check_priming(&request.text, &prior_turns) {
            Some(priming) => FinalResult {
                safe: false,
                confidence: priming.confidence,
                threats: vec![threat::CONTEXT_PRIMING.into(), threat::MULTI_TURN_ATTACK.into()],
                reasoning: format!(
                    "Context priming detected: references never established in this session: {}",
                    priming.missing_references.join(", ")
                ),
                stage: stage::SESSION_GUARD.into(),
                cost: 0.0,
                processing_time_ms: 0,
                recommendation: None,
                needs_review: false,
                session_token: None,
            },
            None => self.run_stages(&request, started).await,
        };

        result.session_token = Some(session_token.clone());
        self.sessions.record_turn(&session_token, &request.text, &result);

        if !result.safe {
            self.note_block(&result.stage, &result.reasoning);
        }
        debug!(
            stage = %result.stage,
            safe = result.safe,
            confidence = result.confidence,
            cost = result.cost,
            elapsed_ms = result.processing_time_ms,
            "validation complete"
        );
        result
    }

    /// Pattern battery onward. Factored out so the session guard's early
    /// block shares the turn-recording tail in `validate`.
    async fn run_stages(&self, request: &ValidationRequest, started: Instant) -> FinalResult {
        let mut ledger = CostLedger::new();
        let mut protocol_tags: Vec<String> = Vec::new();

        // Pattern battery: zero cost, zero charged latency.
        let mut pattern_context = None;
        if !request.options.skip_patterns {
            match self.battery.screen(&request.text) {
                PatternScreen::Block(verdict) => {
                    return FinalResult {
                        safe: false,
                        confidence: verdict.confidence,
                        threats: vec![verdict.threat.into()],
                        reasoning: verdict.reasoning.into(),
                        stage: verdict.stage.into(),
                        cost: 0.0,
                        processing_time_ms: 0,
                        recommendation: None,
                        needs_review: false,
                        session_token: None,
                    };
                }
                PatternScreen::Clean { context } => pattern_context = context,
            }
        }

        // External references: terminal whenever anything is found.
        if !request.options.skip_external_check {
            let scan = self.references.scan(&request.text);
            if let Some(decision) = external_reference::decide(&scan) {
                return FinalResult {
                    safe: decision.safe,
                    confidence: decision.confidence,
                    threats: vec![decision.threat.into()],
                    reasoning: decision.reasoning.into(),
                    stage: decision.stage.into(),
                    cost: 0.0,
                    processing_time_ms: 0,
                    recommendation: None,
                    needs_review: false,
                    session_token: None,
                };
            }
        }

        // Orchestrator: cheap routing call with deadline-aware timeout.
        let timeout = self.stage_timeout(request, started, self.config.timeouts.orchestrator_ms);
        let routing = if timeout.is_zero() {
            RoutingDecision::fail_open("deadline exhausted", false, 0)
        } else {
            orchestrator::route(
                &self.provider,
                &self.config,
                &request.text,
                pattern_context.as_ref(),
                timeout,
            )
            .await
        };
        ledger.add_sequential(routing.cost, routing.elapsed_ms);
        if routing.protocol_violation {
            self.note_protocol_violation(&mut protocol_tags);
        }

        if routing.fast_reject && routing.confidence > consensus::FAST_REJECT_CONFIDENCE {
            let mut threats = vec![threat::ORCHESTRATOR_REJECT.to_string()];
            threats.extend(protocol_tags);
            return FinalResult {
                safe: false,
                confidence: routing.confidence,
                threats,
                reasoning: format!("Orchestrator rejected: {}", routing.reasoning),
                stage: stage::ORCHESTRATOR.into(),
                cost: ledger.cost(),
                processing_time_ms: ledger.elapsed_ms(),
                recommendation: None,
                needs_review: false,
                session_token: None,
            };
        }

        // Specialized validators: independent network calls, run
        // concurrently. A deadline that expired during routing degrades
        // each routed validator straight to its fallback.
        let business_timeout = self.stage_timeout(request, started, self.config.timeouts.business_ms);
        let attack_timeout = self.stage_timeout(request, started, self.config.timeouts.attack_ms);
        let semantic_timeout = self.stage_timeout(request, started, self.config.timeouts.semantic_ms);

        let (business, attack, semantic) = tokio::join!(
            async {
                if !routing.route_business {
                    None
                } else if business_timeout.is_zero() {
                    Some(BusinessVerdict::fallback(false, 0))
                } else {
                    Some(
                        validate_business(
                            &self.provider,
                            &self.config,
                            &request.text,
                            business_timeout,
                        )
                        .await,
                    )
                }
            },
            async {
                if !routing.route_attack {
                    None
                } else if attack_timeout.is_zero() {
                    Some(AttackVerdict::fallback(false, 0))
                } else {
                    Some(
                        detect_attack(
                            &self.provider,
                            &self.config,
                            &request.text,
                            pattern_context.as_ref(),
                            attack_timeout,
                        )
                        .await,
                    )
                }
            },
            async {
                if !routing.route_semantic {
                    None
                } else if semantic_timeout.is_zero() {
                    Some(SemanticVerdict::fallback(false, 0))
                } else {
                    Some(
                        analyze_semantic(
                            &self.provider,
                            &self.config,
                            &request.text,
                            semantic_timeout,
                        )
                        .await,
                    )
                }
            },
        );

        let mut parallel_charges = Vec::with_capacity(3);
        if let Some(verdict) = &business {
            parallel_charges.push((verdict.cost, verdict.elapsed_ms));
            if verdict.protocol_violation {
                self.note_protocol_violation(&mut protocol_tags);
            }
        }
        if let Some(verdict) = &attack {
            parallel_charges.push((verdict.cost, verdict.elapsed_ms));
            if verdict.protocol_violation {
                self.note_protocol_violation(&mut protocol_tags);
            }
        }
        if let Some(verdict) = &semantic {
            parallel_charges.push((verdict.cost, verdict.elapsed_ms));
            if verdict.protocol_violation {
                self.note_protocol_violation(&mut protocol_tags);
            }
        }
        ledger.add_parallel(&parallel_charges);

        // Consensus: pure and deterministic over everything above.
        let consensus_verdict = build_consensus(&ConsensusInput {
            routing: &routing,
            business: business.as_ref(),
            attack: attack.as_ref(),
            semantic: semantic.as_ref(),
        });

        if !consensus_verdict.needs_pass2 {
            let mut threats = consensus_verdict.threats.clone();
            merge_tags(&mut threats, protocol_tags);
            return FinalResult {
                // Undetermined without an escalation flag cannot happen in
                // the cascade; resolve toward safe if it ever did.
                safe: consensus_verdict.safe.unwrap_or(true),
                confidence: consensus_verdict.confidence,
                threats,
                reasoning: consensus_verdict.reasoning.clone(),
                stage: consensus_verdict.stage.into(),
                cost: ledger.cost(),
                processing_time_ms: ledger.elapsed_ms(),
                recommendation: None,
                needs_review: consensus_verdict.needs_review,
                session_token: None,
            };
        }

        // Deep analysis: the expensive final arbiter.
        self.total_pass2.fetch_add(1, Ordering::Relaxed);
        let business_signals = business.as_ref().map(|b| b.signals.clone()).unwrap_or_default();
        let timeout = self.stage_timeout(request, started, self.config.timeouts.deep_analysis_ms);
        let deep = if timeout.is_zero() {
            // Deadline exhausted: same fallback as a call failure.
            deep_analysis::unavailable(&consensus_verdict)
        } else {
            deep_analysis::run(
                &self.provider,
                &self.config,
                &request.text,
                &consensus_verdict,
                &business_signals,
                timeout,
            )
            .await
        };
        ledger.add_sequential(deep.cost, deep.elapsed_ms);
        if deep.protocol_violation {
            self.note_protocol_violation(&mut protocol_tags);
        }

        let mut threats = deep.threats.clone();
        merge_tags(&mut threats, protocol_tags);
        FinalResult {
            safe: deep.safe,
            confidence: deep.confidence,
            threats,
            reasoning: deep.reasoning.clone(),
            stage: deep.stage.into(),
            cost: ledger.cost(),
            processing_time_ms: ledger.elapsed_ms(),
            recommendation: Some(deep_analysis::recommendation(deep.safe, deep.confidence)),
            needs_review: deep.needs_review || consensus_verdict.needs_review,
            session_token: None,
        }
    }

    /// Per-stage timeout bounded by whatever remains of the caller's
    /// deadline. Zero means the stage must degrade without calling out.
    fn stage_timeout(&self, request: &ValidationRequest, started: Instant, stage_ms: u64) -> Duration {
        let stage_budget = Duration::from_millis(stage_ms);
        match request.options.deadline {
            Some(deadline) => stage_budget.min(deadline.saturating_sub(started.elapsed())),
            None => stage_budget,
        }
    }

    fn note_protocol_violation(&self, tags: &mut Vec<String>) {
        self.total_protocol_violations.fetch_add(1, Ordering::Relaxed);
        if !tags.iter().any(|t| t == threat::PROTOCOL_INTEGRITY_VIOLATION) {
            tags.push(threat::PROTOCOL_INTEGRITY_VIOLATION.into());
        }
    }

    fn note_block(&self, stage: &str, details: &str) {
        self.total_blocked.fetch_add(1, Ordering::Relaxed);
        warn!(stage, details, "request blocked");
        let mut alerts = self.alerts.write();
        if alerts.len() >= MAX_ALERTS {
            alerts.remove(0);
        }
        alerts.push(GateAlert {
            timestamp: chrono::Utc::now().timestamp(),
            severity: Severity::High,
            component: "pipeline".into(),
            title: format!("Blocked at {stage}"),
            details: details.into(),
        });
    }

    pub fn total_validated(&self) -> u64 {
        self.total_validated.load(Ordering::Relaxed)
    }
    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }
    pub fn total_pass2(&self) -> u64 {
        self.total_pass2.load(Ordering::Relaxed)
    }
    pub fn total_protocol_violations(&self) -> u64 {
        self.total_protocol_violations.load(Ordering::Relaxed)
    }
    pub fn alerts(&self) -> Vec<GateAlert> {
        self.alerts.read().clone()
    }
}

fn merge_tags(threats: &mut Vec<String>, tags: Vec<String>) {
    for tag in tags {
        if !threats.contains(&tag) {
            threats.push(tag);
        }
    }
}
