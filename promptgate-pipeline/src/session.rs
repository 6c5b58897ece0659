//! Session guard — multi-turn context-priming detection.
//!
//! Single messages can look perfectly reasonable while the conversation is
//! the attack. The guard watches for context priming: a later turn that
//! leans on a fabricated fact ("as per ticket #4521", "you approved this
//! yesterday") never established earlier in the same session.
//!
//! State machine per turn:
//! - no session token → mint one, create the record lazily, run the pipeline
//! - session with empty history → run the pipeline
//! - session with history → extract candidate references from the current
//!   turn (ticket/case numbers, document names, discussed-earlier phrasing,
//!   authorization claims, meeting references); any reference absent from
//!   every prior turn blocks immediately, before the main pipeline runs
//!
//! Every turn, blocked or not, is appended to history afterwards; history
//! is capped at the last 50 turns, oldest dropped first. Sessions expire
//! 2 hours after creation; an expired session is identical to no session.
//! Store failures fail open: losing the guard must not block all traffic.

use crate::types::{threat, FinalResult, GateAlert, Severity};
use parking_lot::RwLock;
use promptgate_core::{GateError, GateResult};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

const MAX_ALERTS: usize = 1_000;

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionTurn {
    pub text: String,
    pub blocked: bool,
    pub threats: Vec<String>,
    pub confidence: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub token: String,
    pub history: VecDeque<SessionTurn>,
    pub flags: HashMap<String, String>,
    pub created_at: i64,
    pub last_activity: i64,
    pub request_count: u64,
}

impl SessionRecord {
    fn new(token: &str, now: i64) -> Self {
        Self {
            token: token.into(),
            history: VecDeque::new(),
            flags: HashMap::new(),
            created_at: now,
            last_activity: now,
            request_count: 0,
        }
    }
}

// ── Store seam ──────────────────────────────────────────────────────────────

/// Narrow interface over the externally-owned session store. Keys are
/// opaque tokens; the guard never inspects them.
pub trait SessionStore: Send + Sync {
    fn get(&self, token: &str) -> GateResult<Option<SessionRecord>>;
    fn put(&self, record: SessionRecord) -> GateResult<()>;
    /// Append-only-then-trim, safe under concurrent turns from one session.
    fn append_turn(&self, token: &str, turn: SessionTurn, history_cap: usize) -> GateResult<()>;
    fn set_flag(&self, token: &str, key: &str, value: &str) -> GateResult<()>;
    fn delete(&self, token: &str) -> GateResult<()>;
}

/// In-memory store for tests and single-node deployments. Expiry is
/// enforced on access: 2 hours after creation the record reads as absent.
pub struct InMemorySessionStore {
    ttl_secs: i64,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new(ttl_secs: i64) -> Self {
        Self { ttl_secs, sessions: RwLock::new(HashMap::new()) }
    }

    fn expired(&self, record: &SessionRecord) -> bool {
        chrono::Utc::now().timestamp() - record.created_at >= self.ttl_secs
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, token: &str) -> GateResult<Option<SessionRecord>> {
        {
            let sessions = self.sessions.read();
            match sessions.get(token) {
                Some(record) if !self.expired(record) => return Ok(Some(record.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        self.sessions.write().remove(token);
        Ok(None)
    }

    fn put(&self, record: SessionRecord) -> GateResult<()> {
        self.sessions.write().insert(record.token.clone(), record);
        Ok(())
    }

    fn append_turn(&self, token: &str, turn: SessionTurn, history_cap: usize) -> GateResult<()> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(token)
            .ok_or_else(|| GateError::Store(format!("unknown session {token}")))?;
        record.history.push_back(turn);
        while record.history.len() > history_cap {
            record.history.pop_front();
        }
        record.last_activity = chrono::Utc::now().timestamp();
        record.request_count += 1;
        Ok(())
    }

    fn set_flag(&self, token: &str, key: &str, value: &str) -> GateResult<()> {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(token) {
            record.flags.insert(key.into(), value.into());
        }
        Ok(())
    }

    fn delete(&self, token: &str) -> GateResult<()> {
        self.sessions.write().remove(token);
        Ok(())
    }
}

// ── Priming detection ───────────────────────────────────────────────────────

/// A context-priming hit: which families fired and the references that
/// were never established.
#[derive(Debug, Clone)]
pub struct PrimingBlock {
    pub families: Vec<&'static str>,
    pub missing_references: Vec<String>,
    pub confidence: f64,
}

const PRIMING_FAMILIES: &[(&str, &str)] = &[
    ("ticket_refs", r"(?i)ticket\s*#?\d+|issue\s*#?\d+|case\s*#?\d+"),
    ("doc_refs", r"(?i)document\s+\w+|file\s+\w+|attachment\s+\w+"),
    ("conv_refs", r"(?i)(as|like)\s+(we|you)\s+(discussed|said|agreed|mentioned|talked\s+about)"),
    ("auth_refs", r"(?i)(as\s+)?(previously\s+)?(authorized|approved|permitted|allowed)"),
    ("meeting_refs", r"(?i)(in|during|from)\s+(yesterday's|today's|last\s+week's)\s+(meeting|discussion|call)"),
];

// ── Guard ───────────────────────────────────────────────────────────────────

pub struct SessionGuard<S: SessionStore> {
    store: S,
    history_cap: usize,
    families: Vec<(&'static str, Regex)>,

    total_turns: AtomicU64,
    total_priming_blocks: AtomicU64,
    total_sessions_created: AtomicU64,
    alerts: RwLock<Vec<GateAlert>>,
}

impl<S: SessionStore> SessionGuard<S> {
    pub fn new(store: S, history_cap: usize) -> Self {
        Self {
            store,
            history_cap,
            families: PRIMING_FAMILIES
                .iter()
                .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (*name, re)))
                .collect(),
            total_turns: AtomicU64::new(0),
            total_priming_blocks: AtomicU64::new(0),
            total_sessions_created: AtomicU64::new(0),
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve the caller's token to a live session, creating one lazily.
    /// Returns the token to hand back plus the prior turn texts (empty for
    /// a fresh or expired session). Store failures fail open to a fresh
    /// in-request session.
    pub fn resolve(&self, token: Option<&str>) -> (String, Vec<String>) {
        let now = chrono::Utc::now().timestamp();
        let token = token.map(str::to_string).unwrap_or_else(mint_token);

        match self.store.get(&token) {
            Ok(Some(record)) => {
                let prior = record.history.iter().map(|t| t.text.clone()).collect();
                (token, prior)
            }
            Ok(None) => {
                self.total_sessions_created.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.store.put(SessionRecord::new(&token, now)) {
                    warn!(error = %e, "session store put failed, proceeding without history");
                }
                (token, vec![])
            }
            Err(e) => {
                warn!(error = %e, "session store unavailable, proceeding without history");
                (token, vec![])
            }
        }
    }

    /// Context-priming check for one turn against the session's prior turns.
    /// Only meaningful when history is non-empty.
    pub fn check_priming(&self, text: &str, prior_turns: &[String]) -> Option<PrimingBlock> {
        if prior_turns.is_empty() {
            return None;
        }

        let prior_lower: Vec<String> = prior_turns.iter().map(|t| t.to_lowercase()).collect();
        let mut families = Vec::new();
        let mut missing = Vec::new();

        for (name, regex) in &self.families {
            for found in regex.find_iter(text) {
                let reference = found.as_str().to_lowercase();
                let established = prior_lower.iter().any(|turn| turn.contains(&reference));
                if !established {
                    if !families.contains(name) {
                        families.push(*name);
                    }
                    missing.push(found.as_str().to_string());
                }
            }
        }

        if families.is_empty() {
            return None;
        }

        self.total_priming_blocks.fetch_add(1, Ordering::Relaxed);
        warn!(families = ?families, "context priming detected, blocking turn");
        self.add_alert(
            Severity::High,
            "Context priming blocked",
            &format!("families={families:?}, missing={missing:?}"),
        );
        Some(PrimingBlock { families, missing_references: missing, confidence: 0.9 })
    }

    /// Append the processed turn to history, blocked or not.
    pub fn record_turn(&self, token: &str, text: &str, result: &FinalResult) {
        self.total_turns.fetch_add(1, Ordering::Relaxed);
        let turn = SessionTurn {
            text: text.into(),
            blocked: !result.safe,
            threats: result.threats.clone(),
            confidence: result.confidence,
            timestamp: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self.store.append_turn(token, turn, self.history_cap) {
            warn!(error = %e, "session store append failed");
        }
        if result.threats.iter().any(|t| t == threat::CONTEXT_PRIMING) {
            if let Err(e) = self.store.set_flag(token, "context_priming_detected", "true") {
                warn!(error = %e, "session store flag update failed");
            }
        }
    }

    fn add_alert(&self, severity: Severity, title: &str, details: &str) {
        let mut alerts = self.alerts.write();
        if alerts.len() >= MAX_ALERTS {
            alerts.remove(0);
        }
        alerts.push(GateAlert {
            timestamp: chrono::Utc::now().timestamp(),
            severity,
            component: "session_guard".into(),
            title: title.into(),
            details: details.into(),
        });
    }

    pub fn total_turns(&self) -> u64 {
        self.total_turns.load(Ordering::Relaxed)
    }
    pub fn total_priming_blocks(&self) -> u64 {
        self.total_priming_blocks.load(Ordering::Relaxed)
    }
    pub fn total_sessions_created(&self) -> u64 {
        self.total_sessions_created.load(Ordering::Relaxed)
    }
    pub fn alerts(&self) -> Vec<GateAlert> {
        self.alerts.read().clone()
    }
}

/// Opaque session token: `sess_` plus 256 bits of hex.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    let mut token = String::with_capacity(5 + 64);
    token.push_str("sess_");
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(token, "{b:02x}");
    }
    token
}
