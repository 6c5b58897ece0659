//! Reputation gate — the pre-filter priority chain.
//!
//! Evaluated before anything else, each step short-circuiting the rest of
//! the chain:
//!
//! 1. test-harness marker header, validated by EXACT case-insensitive match
//!    against a small fixed set (never substring or regex, so the header
//!    value cannot be used as an injection vector)
//! 2. address on the administrator-entered allowlist (raw address)
//! 3. internal/operator tier
//! 4. address on the administrator-entered denylist (raw address)
//! 5. tier gating: tiers outside reputation scoring skip the lookup
//! 6. reputation lookup keyed by a one-way hash of the address; accounts
//!    opted into auto-blocking are blocked when the address is flagged
//!
//! A bypass skips the remaining reputation checks; the validation pipeline
//! itself still runs. Only the denylist and the auto-block step produce a
//! block. Store failures fail open: the core safety pipeline outranks the
//! lesser protection this gate provides.

use crate::types::{CallerContext, GateAlert, Severity, Tier};
use parking_lot::RwLock;
use promptgate_core::GateResult;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

const MAX_ALERTS: usize = 1_000;

/// Header values accepted as a test-harness marker, compared exactly after
/// ASCII lowercasing.
const ACCEPTED_TEST_MARKERS: &[&str] = &["true", "1", "yes"];

// ── Records ─────────────────────────────────────────────────────────────────

/// Externally persisted reputation record, keyed by address hash.
#[derive(Debug, Clone, Default)]
pub struct ReputationRecord {
    pub score: f64,
    pub block_rate: f64,
    pub sample_count: u64,
    pub auto_block: bool,
    pub attack_types: Vec<String>,
}

impl ReputationRecord {
    /// Scoring formula used by the collaborator's batch job: 70% block rate,
    /// 30% average severity, with auto-block at >80% block rate over at
    /// least 5 samples. Exposed so operators can precompute records the
    /// same way.
    pub fn from_samples(total: u64, blocked: u64, severity_avg: f64) -> Self {
        let block_rate = if total == 0 { 0.0 } else { blocked as f64 / total as f64 };
        Self {
            score: (block_rate * 0.7 + severity_avg * 0.3).min(1.0),
            block_rate,
            sample_count: total,
            auto_block: block_rate > 0.8 && total >= 5,
            attack_types: vec![],
        }
    }
}

/// Outcome of the gate. `source` says which record type decided.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationDecision {
    pub allowed: bool,
    pub source: &'static str,
    pub score: f64,
    pub bypass_reason: Option<&'static str>,
    pub block_reason: Option<&'static str>,
}

impl ReputationDecision {
    fn allow(source: &'static str, score: f64, bypass_reason: Option<&'static str>) -> Self {
        Self { allowed: true, source, score, bypass_reason, block_reason: None }
    }

    fn block(source: &'static str, score: f64, reason: &'static str) -> Self {
        Self { allowed: false, source, score, bypass_reason: None, block_reason: Some(reason) }
    }
}

// ── Store seam ──────────────────────────────────────────────────────────────

/// Narrow interface over the externally persisted reputation data. Allow and
/// deny lists are keyed by raw address (administrator-entered); reputation
/// records by the one-way address hash.
pub trait ReputationStore: Send + Sync {
    fn is_allowlisted(&self, address: &str) -> GateResult<bool>;
    fn is_denylisted(&self, address: &str) -> GateResult<bool>;
    fn reputation(&self, address_hash: &str) -> GateResult<Option<ReputationRecord>>;
}

/// In-memory store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryReputationStore {
    allowlist: RwLock<HashSet<String>>,
    denylist: RwLock<HashSet<String>>,
    records: RwLock<HashMap<String, ReputationRecord>>,
}

impl InMemoryReputationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, address: &str) {
        self.allowlist.write().insert(address.into());
    }

    pub fn deny(&self, address: &str) {
        self.denylist.write().insert(address.into());
    }

    pub fn record(&self, address: &str, record: ReputationRecord) {
        self.records.write().insert(hash_address(address), record);
    }
}

impl ReputationStore for InMemoryReputationStore {
    fn is_allowlisted(&self, address: &str) -> GateResult<bool> {
        Ok(self.allowlist.read().contains(address))
    }

    fn is_denylisted(&self, address: &str) -> GateResult<bool> {
        Ok(self.denylist.read().contains(address))
    }

    fn reputation(&self, address_hash: &str) -> GateResult<Option<ReputationRecord>> {
        Ok(self.records.read().get(address_hash).cloned())
    }
}

/// One-way hash used for reputation keys. Raw addresses never reach the
/// scoring store.
pub fn hash_address(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// ── Gate ────────────────────────────────────────────────────────────────────

pub struct ReputationGate<R: ReputationStore> {
    store: R,

    total_evaluated: AtomicU64,
    total_bypassed: AtomicU64,
    total_blocked: AtomicU64,
    alerts: RwLock<Vec<GateAlert>>,
}

impl<R: ReputationStore> ReputationGate<R> {
    pub fn new(store: R) -> Self {
        Self {
            store,
            total_evaluated: AtomicU64::new(0),
            total_bypassed: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    pub fn evaluate(&self, caller: &CallerContext) -> ReputationDecision {
        self.total_evaluated.fetch_add(1, Ordering::Relaxed);

        // 1. Test-harness marker: exact match only.
        if let Some(marker) = &caller.test_marker {
            if ACCEPTED_TEST_MARKERS.contains(&marker.to_ascii_lowercase().as_str()) {
                self.total_bypassed.fetch_add(1, Ordering::Relaxed);
                return ReputationDecision::allow("default", 0.0, Some("test_suite_header"));
            }
        }

        let address = match &caller.address {
            Some(address) => address.as_str(),
            None => return ReputationDecision::allow("default", 0.0, None),
        };

        // 2. Allowlist, raw address.
        match self.store.is_allowlisted(address) {
            Ok(true) => {
                self.total_bypassed.fetch_add(1, Ordering::Relaxed);
                return ReputationDecision::allow("whitelist", 0.0, Some("ip_allowlist"));
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "allowlist lookup failed, failing open"),
        }

        // 3. Internal tier bypasses the rest, denylist included.
        if caller.tier == Tier::Internal {
            self.total_bypassed.fetch_add(1, Ordering::Relaxed);
            return ReputationDecision::allow("default", 0.0, Some("internal_tier"));
        }

        // 4. Denylist, raw address.
        match self.store.is_denylisted(address) {
            Ok(true) => {
                self.total_blocked.fetch_add(1, Ordering::Relaxed);
                self.add_alert(
                    Severity::High,
                    "Denylisted address blocked",
                    &format!("address_hash={}", hash_address(address)),
                );
                return ReputationDecision::block("blacklist", 1.0, "ip_denylist");
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "denylist lookup failed, failing open"),
        }

        // 5. Tier gating: only scoring tiers read reputation.
        if !caller.tier.participates_in_reputation() {
            return ReputationDecision::allow("default", 0.0, None);
        }

        // 6. Reputation lookup by one-way hash.
        let record = match self.store.reputation(&hash_address(address)) {
            Ok(Some(record)) => record,
            Ok(None) => return ReputationDecision::allow("reputation", 0.0, None),
            Err(e) => {
                warn!(error = %e, "reputation lookup failed, failing open");
                return ReputationDecision::allow("default", 0.0, None);
            }
        };

        if caller.auto_block_enabled && record.auto_block {
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
            warn!(
                score = record.score,
                block_rate = record.block_rate,
                samples = record.sample_count,
                "auto-blocking flagged address"
            );
            self.add_alert(
                Severity::Critical,
                "Known bad actor auto-blocked",
                &format!(
                    "score={:.2}, block_rate={:.2}, samples={}",
                    record.score, record.block_rate, record.sample_count
                ),
            );
            return ReputationDecision::block("reputation", record.score, "ip_auto_block");
        }

        ReputationDecision::allow("reputation", record.score, None)
    }

    fn add_alert(&self, severity: Severity, title: &str, details: &str) {
        let mut alerts = self.alerts.write();
        if alerts.len() >= MAX_ALERTS {
            alerts.remove(0);
        }
        alerts.push(GateAlert {
            timestamp: chrono::Utc::now().timestamp(),
            severity,
            component: "reputation_gate".into(),
            title: title.into(),
            details: details.into(),
        });
    }

    pub fn total_evaluated(&self) -> u64 {
        self.total_evaluated.load(Ordering::Relaxed)
    }
    pub fn total_bypassed(&self) -> u64 {
        self.total_bypassed.load(Ordering::Relaxed)
    }
    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }
    pub fn alerts(&self) -> Vec<GateAlert> {
        self.alerts.read().clone()
    }
}
