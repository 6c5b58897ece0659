//! Pattern battery — zero-cost signature screening for common attacks.
//!
//! Two batteries run before any model is consulted:
//!
//! 1. **Signature families** — XSS, SQL injection, template/expression
//!    injection, command injection, semantic-extraction phrasing, and
//!    fetch-then-execute phrasing. The families are independent; every one is
//!    evaluated and the reported outcome follows a fixed priority order so an
//!    input matching several families is always attributed the same way.
//! 2. **Literal checks** — known jailbreak phrases (including multi-language
//!    "ignore instructions" variants) and character/word repetition padding.
//!
//! The SQL family carries the single context override: when the text also
//! contains an educational/research keyword, the SQL match is not terminal
//! and the request falls through to the AI stages with pattern-context
//! metadata attached. This accepts some false negatives to avoid blocking
//! security-education questions; no other family is softened this way.
//!
//! Every match is a terminal block with zero cost and zero latency charged.

use crate::types::{stage, threat};
use regex::Regex;

// ── Signature tables ────────────────────────────────────────────────────────

const XSS_PATTERNS: &[&str] = &[
    r"(?is)<script[^>]*>.*?</script>",
    r"(?i)<script[^>]*/>",
    r#"(?i)javascript:\s*[^"\s]"#,
    r"(?i)<[^>]+on\w+\s*=\s*[^>]*>",
    r"(?i)on(load|error|click|mouseover|focus|blur|change)\s*=",
    r"(?i)<(iframe|embed|object|svg)[^>]*>",
    r"(?i)String\.fromCharCode\s*\(",
    r"(?i)eval\s*\(",
    r"(?i)Function\s*\(",
    r"(?i)setTimeout\s*\(",
    r"(?i)setInterval\s*\(",
    r"(?i)<svg[^>]*on\w+",
    r"(?i)<img[^>]*on\w+",
    r"(?i)<body[^>]*on\w+",
    r"(?i)alert\s*\([^)]*\)",
    r"(?i)prompt\s*\([^)]*\)",
    r"(?i)confirm\s*\([^)]*\)",
    r#"(?i)data:text/html[^"'\s]*script"#,
];

const SQL_PATTERNS: &[&str] = &[
    r#"(?i)'\s*(OR|AND)\s*['"]?\d+['"]?\s*=\s*['"]?\d+"#,
    r"(?i)'\s*OR\s+\d+\s*=\s*\d+\s*--",
    r"(?i)'\s*;\s*DROP\s+TABLE",
    r"(?i)'\s*;\s*DELETE\s+FROM",
    r"(?i)'\s*;\s*INSERT\s+INTO",
    r"(?i)'\s*;\s*UPDATE\s+\w+\s+SET",
    r"(?i)UNION\s+SELECT",
    r"(?i)'\s*;\s*EXEC\s*\(",
    r"(?i)'\s*;\s*EXECUTE\s*\(",
    r"--\s*$",
    r"(?s)/\*.*?\*/",
];

const TEMPLATE_PATTERNS: &[&str] = &[
    r"\{\{[^}]*\}\}",
    r"\$\{[^}]*\}",
    r"#\{[^}]*\}",
    r"<%[^%]*%>",
    r"@\{[^}]*\}",
    r"\[\[[^\]]*\]\]",
    r"\$\([^)]*\)",
];

const COMMAND_PATTERNS: &[&str] = &[
    r"(?i);\s*(ls|cat|rm|wget|curl|nc|bash|sh|python|perl|ruby|php)\s",
    r"(?i)\|\s*(ls|cat|rm|wget|curl|nc|bash|sh|python|perl|ruby|php)\s",
    r"`[^`]*`",
    r"\$\(.*?\)",
    r"(?i)&&\s*(ls|cat|rm|wget|curl|nc|bash|sh)\s",
    r"(?i)\|\|\s*(ls|cat|rm|wget|curl|nc|bash|sh)\s",
];

const SEMANTIC_EXTRACTION_PATTERNS: &[&str] = &[
    r"(?i)tell me a (riddle|puzzle|game)\s+(where|that|whose)\s+(the\s+)?answer\s+(is|contains)",
    r"(?i)what (word|phrase|term)\s+rhymes\s+with\s+(the\s+)?(password|secret|key|token)",
    r"(?i)define\s+(the\s+)?(word|term)\s+that\s+(is|has).{0,50}(password|secret|key|letter)",
    r"(?i)spell\s+out\s+(the\s+)?(password|secret|key|word)",
    r"(?i)first\s+letter\s+of\s+(the\s+|each\s+)?(password|secret|word)",
    r"(?i)hint\s+about\s+(the\s+)?(password|secret|key)",
    r"(?i)acronym\s+(for|of)\s+(the\s+)?(password|secret)",
    r"(?i)sounds\s+like\s+(the\s+)?(password|secret)",
];

const EXECUTION_PATTERNS: &[&str] = &[
    r"(?i)(fetch|get|retrieve|download|load|pull).{0,30}(execute|run|eval|process)",
    r"(?i)(visit|navigate|go to).{0,30}(execute|run|follow instructions)",
    r"(?i)decode.{0,20}(execute|run|eval)",
    r"(?i)translate.{0,20}(execute|run|eval)",
];

const JAILBREAK_PATTERNS: &[&str] = &[
    r"(?i)\bstan\b.*?\bstands for\b",
    r"(?i)\baim\b.*?always intelligent and machiavellian",
    r"(?i)\bdevmode\b.*?developer",
    r"(?i)you are now.*?(dan|unrestricted|jailbroken)",
    r"(?i)pretend to be.*?(dan|stan|aim|devmode)",
    r"(?i)you are going to pretend to be",
    r"(?i)^ignore all previous instructions",
    r"(?i)^reveal your system prompt$",
    r"(?i)^bypass (all )?safety checks?",
    r"(?i)as your (developer|creator) at (anthropic|openai)",
    // Multi-language "ignore instructions" variants
    r"(?i)ignora.*?instrucciones anteriores",
    r"以前の指示を無視",
    r"忽略.*?说明",
    r"(?i)ignorez.*?instructions précédentes",
    r"(?i)ignoriere.*?vorherigen anweisungen",
];

/// Educational/research keywords. Presence of any single one suppresses the
/// SQL family's terminal block (and only that family's).
const EDUCATIONAL_KEYWORDS: &[&str] = &[
    "educational", "example", "explain", "training", "course", "lesson",
    "tutorial", "demonstrate", "learn", "teach", "academic", "research",
    "paper", "thesis", "study", "security team", "for my", "how does",
    "what is", "can you explain",
];

/// Business-context keywords; two or more count as business context. Used
/// only as routing metadata for the orchestrator, never to suppress a block.
const BUSINESS_KEYWORDS: &[&str] = &[
    "meeting", "discussed", "yesterday", "approved", "emergency",
    "process", "standard", "policy", "procedure", "management",
    "directive", "quarterly", "budget", "projection", "order #",
    "ticket #", "refund", "subscription", "support team", "supervisor",
];

// ── Verdicts ────────────────────────────────────────────────────────────────

/// A terminal pattern-stage block.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternVerdict {
    pub stage: &'static str,
    pub threat: &'static str,
    pub confidence: f64,
    pub reasoning: &'static str,
}

/// Metadata handed to the orchestrator when a family almost fired but was
/// suppressed by context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternContext {
    pub family: &'static str,
    pub context_kind: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternScreen {
    Block(PatternVerdict),
    Clean { context: Option<PatternContext> },
}

// ── Battery ─────────────────────────────────────────────────────────────────

pub struct PatternBattery {
    xss: Vec<Regex>,
    sql: Vec<Regex>,
    template: Vec<Regex>,
    command: Vec<Regex>,
    semantic: Vec<Regex>,
    execution: Vec<Regex>,
    jailbreak: Vec<Regex>,
}

impl PatternBattery {
    pub fn new() -> Self {
        Self {
            xss: Self::compile(XSS_PATTERNS),
            sql: Self::compile(SQL_PATTERNS),
            template: Self::compile(TEMPLATE_PATTERNS),
            command: Self::compile(COMMAND_PATTERNS),
            semantic: Self::compile(SEMANTIC_EXTRACTION_PATTERNS),
            execution: Self::compile(EXECUTION_PATTERNS),
            jailbreak: Self::compile(JAILBREAK_PATTERNS),
        }
    }

    fn compile(patterns: &[&str]) -> Vec<Regex> {
        patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    }

    /// Run both batteries over the raw text.
    ///
    /// All families are evaluated before deciding so the reported family
    /// always follows the fixed priority order (XSS → SQL → template →
    /// command → semantic-extraction → fetch-execute, then jailbreak and
    /// repetition), not whichever regex happened to match first.
    pub fn screen(&self, text: &str) -> PatternScreen {
        let xss = Self::matches_any(&self.xss, text);
        let sql = Self::matches_any(&self.sql, text);
        let template = Self::matches_any(&self.template, text);
        let command = Self::matches_any(&self.command, text);
        let semantic = Self::matches_any(&self.semantic, text);
        let execution = Self::matches_any(&self.execution, text);

        let educational = has_educational_context(text);

        if xss {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::XSS_PATTERN,
                threat: threat::XSS_ATTACK,
                confidence: 0.95,
                reasoning: "XSS attack pattern detected (script execution attempt)",
            });
        }
        let mut suppressed_sql = false;
        if sql {
            if educational {
                // Deliberate false-negative tradeoff: a security-education
                // question about SQL injection falls through to the AI
                // stages instead of blocking here.
                suppressed_sql = true;
            } else {
                return PatternScreen::Block(PatternVerdict {
                    stage: stage::SQL_PATTERN,
                    threat: threat::SQL_INJECTION,
                    confidence: 0.95,
                    reasoning: "SQL injection pattern detected (database manipulation attempt)",
                });
            }
        }
        if template {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::TEMPLATE_PATTERN,
                threat: threat::TEMPLATE_INJECTION,
                confidence: 0.90,
                reasoning: "Template injection pattern detected (server-side code execution attempt)",
            });
        }
        if command {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::COMMAND_PATTERN,
                threat: threat::COMMAND_INJECTION,
                confidence: 0.95,
                reasoning: "Command injection pattern detected (system command execution attempt)",
            });
        }
        if semantic {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::SEMANTIC_PATTERN,
                threat: threat::SEMANTIC_EXTRACTION,
                confidence: 0.90,
                reasoning: "Semantic extraction pattern detected (indirect retrieval via riddles, rhymes, or definitions)",
            });
        }
        if execution {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::EXECUTION_PATTERN,
                threat: threat::EXECUTION_COMMAND,
                confidence: 0.92,
                reasoning: "Execution command pattern detected (fetch/decode and execute instructions)",
            });
        }

        // Second battery: literal jailbreak phrases and padding.
        if Self::matches_any(&self.jailbreak, text) {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::JAILBREAK_PATTERN,
                threat: threat::JAILBREAK_ATTEMPT,
                confidence: 0.95,
                reasoning: "Jailbreak pattern detected (DAN, STAN, AIM, or multi-language bypass attempt)",
            });
        }
        if has_repetition_padding(text) {
            return PatternScreen::Block(PatternVerdict {
                stage: stage::REPETITION_PATTERN,
                threat: threat::FILTER_BYPASS,
                confidence: 0.92,
                reasoning: "Repetition/padding pattern detected (filter bypass attempt)",
            });
        }

        let context = if suppressed_sql {
            Some(PatternContext {
                family: stage::SQL_PATTERN,
                context_kind: "educational",
            })
        } else {
            None
        };
        PatternScreen::Clean { context }
    }

    fn matches_any(patterns: &[Regex], text: &str) -> bool {
        patterns.iter().any(|p| p.is_match(text))
    }
}

impl Default for PatternBattery {
    fn default() -> Self {
        Self::new()
    }
}

// ── Context keyword checks ──────────────────────────────────────────────────

/// One educational keyword is enough.
pub fn has_educational_context(text: &str) -> bool {
    let lower = text.to_lowercase();
    EDUCATIONAL_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Business context requires at least two distinct keywords.
pub fn has_business_context(text: &str) -> bool {
    let lower = text.to_lowercase();
    BUSINESS_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() >= 2
}

// ── Repetition padding ──────────────────────────────────────────────────────

/// Same character repeated more than 20 times, or the same word repeated
/// more than 8 times consecutively.
fn has_repetition_padding(text: &str) -> bool {
    let mut run = 0usize;
    let mut prev: Option<char> = None;
    for ch in text.chars() {
        if Some(ch) == prev {
            run += 1;
            if run > 20 {
                return true;
            }
        } else {
            prev = Some(ch);
            run = 1;
        }
    }

    let mut word_run = 0usize;
    let mut prev_word: Option<&str> = None;
    for word in text.split_whitespace() {
        if Some(word) == prev_word {
            word_run += 1;
            if word_run > 8 {
                return true;
            }
        } else {
            prev_word = Some(word);
            word_run = 1;
        }
    }
    false
}
