//! External-reference stage — URLs, IPs, file paths, and their disguises.
//!
//! The classifier itself is a collaborator behind [`ReferenceClassifier`];
//! this core consumes its typed verdict and applies a fixed decision table:
//!
//! | finding                         | outcome                        |
//! |---------------------------------|--------------------------------|
//! | encoded or obfuscated reference | block, confidence 0.90         |
//! | sensitive path reference        | block, confidence 0.90         |
//! | action verb + any reference     | block, confidence 0.85         |
//! | plain mention only              | allow + warning tag, 0.70      |
//!
//! Any outcome here is terminal for the request and costs no AI calls.
//!
//! [`HeuristicReferenceClassifier`] is the in-tree baseline so the pipeline
//! works standalone: text normalizers undo spacing/defanging/homoglyph
//! tricks, then reference patterns run over the normalized text, and
//! base64/hex/ROT13 probes look for encoded references.

use crate::types::{stage, threat};
use base64::Engine;
use regex::Regex;

// ── Collaborator contract ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Url,
    Ip,
    FilePath,
    Command,
}

/// Typed verdict from the reference classifier.
#[derive(Debug, Clone, Default)]
pub struct ReferenceScan {
    pub has_references: bool,
    pub kinds: Vec<ReferenceKind>,
    /// Which encoding hid a reference, if any ("base64", "hex", "rot13").
    pub encoding: Option<&'static str>,
    /// Normalization changed the text in a way that revealed a reference.
    pub obfuscated: bool,
    /// The surrounding text tells the reader to visit/fetch/open the target.
    pub action_verb: bool,
    /// A credential/key file or system path is referenced.
    pub sensitive_path: bool,
}

pub trait ReferenceClassifier: Send + Sync {
    fn scan(&self, text: &str) -> ReferenceScan;
}

// ── Decision table ──────────────────────────────────────────────────────────

/// Terminal outcome of the external-reference stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDecision {
    pub safe: bool,
    pub confidence: f64,
    pub threat: &'static str,
    pub reasoning: &'static str,
    pub stage: &'static str,
}

/// Apply the fixed decision table. `None` means no references were found and
/// the pipeline continues.
pub fn decide(scan: &ReferenceScan) -> Option<ReferenceDecision> {
    if !scan.has_references {
        return None;
    }

    if scan.encoding.is_some() || scan.obfuscated {
        return Some(ReferenceDecision {
            safe: false,
            confidence: 0.90,
            threat: if scan.encoding.is_some() {
                threat::ENCODED_REFERENCE
            } else {
                threat::OBFUSCATED_REFERENCE
            },
            reasoning: "Encoded or obfuscated external reference detected, likely evasion attempt",
            stage: stage::EXTERNAL_REFERENCE,
        });
    }

    if scan.sensitive_path {
        return Some(ReferenceDecision {
            safe: false,
            confidence: 0.90,
            threat: threat::SENSITIVE_FILE_REFERENCE,
            reasoning: "Sensitive file path referenced (credentials, keys, or system files)",
            stage: stage::EXTERNAL_REFERENCE,
        });
    }

    if scan.action_verb {
        return Some(ReferenceDecision {
            safe: false,
            confidence: 0.85,
            threat: threat::EXTERNAL_REFERENCE_EXECUTION,
            reasoning: "Action verb combined with an external reference, potential fetch-and-act instruction",
            stage: stage::EXTERNAL_REFERENCE,
        });
    }

    Some(ReferenceDecision {
        safe: true,
        confidence: 0.70,
        threat: threat::EXTERNAL_REFERENCE,
        reasoning: "External reference present; content cannot be validated, allowed with warning",
        stage: stage::EXTERNAL_REFERENCE,
    })
}

// ── Baseline classifier ─────────────────────────────────────────────────────

const URL_PATTERNS: &[&str] = &[
    r#"(?i)https?://[^\s<>"{}|\\^`\[\]]+"#,
    r#"(?i)(ftp|file|ssh|telnet|vnc|rdp)://[^\s<>"{}|\\^`\[\]]+"#,
    r#"(?i)www\.[a-z0-9][a-z0-9-]*[a-z0-9]\.[^\s<>"{}|\\^`\[\]]+"#,
    r"(?i)\b[a-z0-9][a-z0-9-]*\.(com|org|net|io|dev|app|ai|cloud|xyz|edu|gov|mil|biz|info)(/[^\s]*)?",
    r"(?i)(bit\.ly|tinyurl\.com|goo\.gl|t\.co|short\.link|tiny\.cc|ow\.ly|is\.gd|buff\.ly)/[a-z0-9]+",
    r"(?i)localhost(:[0-9]{1,5})?",
    r"127\.0\.0\.1(:[0-9]{1,5})?",
];

const IP_PATTERNS: &[&str] = &[
    r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
    r"(?i)\b(?:[a-f0-9]{1,4}:){7}[a-f0-9]{1,4}\b",
];

const FILE_PATTERNS: &[&str] = &[
    r"/(home|usr|var|etc|tmp|opt|bin|sbin|lib|mnt|media|root|boot|dev|proc|sys)/[\w\-./]+",
    r"(?i)[a-z]:\\(?:[\w\-. ]+\\)*[\w\-. ]+",
    r"(?i)file:///?.+",
    r"\.\./[\w\-./]+",
];

const COMMAND_REFERENCE_PATTERNS: &[&str] = &[
    r#"(?i)(fetch|read|load|retrieve|download|curl|wget|request|pull|grab)\s+(from\s+)?['"]?[^\s'"]+"#,
    r#"(?i)(navigate|visit|browse)\s+(to\s+)?['"]?[^\s'"]+"#,
    r"(?i)(follow|click)\s+(this\s+)?(link|url|address)",
];

const ACTION_PATTERNS: &[&str] = &[
    r"(?i)\bvisit\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\bcheck\s+out\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\baccess\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\bgo\s+to\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\bfetch\s+(the|this|it|that|from|https?|www\.|ftp)",
    r"(?i)\bnavigate\s+(to|the|this)",
    r"(?i)\bopen\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\bbrowse\s+(to|the|this|https?|www\.|ftp)",
    r"(?i)\bclick\s+(on|the|this)",
    r"(?i)\bfollow\s+(the|this|it|that)",
    r"(?i)\bsee\s+what\b",
    r"(?i)\blook\s+at\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\btell\s+me\s+what\b",
    r"(?i)\breview\s+(the|this|it|that|https?|www\.|ftp)",
    r"(?i)\bload\s+(the|this|it|that|from|https?|www\.|ftp)",
    r"(?i)\bretrieve\s+(the|this|it|that|from|https?|www\.|ftp)",
];

const SENSITIVE_PATH_PATTERNS: &[&str] = &[
    r"(?i)/etc/passwd",
    r"(?i)/etc/shadow",
    r"(?i)/etc/sudoers",
    r"(?i)/root/",
    r"(?i)\.ssh/id_rsa",
    r"(?i)\.aws/credentials",
    r"(?i)\.env\b",
];

pub struct HeuristicReferenceClassifier {
    urls: Vec<Regex>,
    ips: Vec<Regex>,
    files: Vec<Regex>,
    commands: Vec<Regex>,
    actions: Vec<Regex>,
    sensitive: Vec<Regex>,
}

impl HeuristicReferenceClassifier {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
        };
        Self {
            urls: compile(URL_PATTERNS),
            ips: compile(IP_PATTERNS),
            files: compile(FILE_PATTERNS),
            commands: compile(COMMAND_REFERENCE_PATTERNS),
            actions: compile(ACTION_PATTERNS),
            sensitive: compile(SENSITIVE_PATH_PATTERNS),
        }
    }

    /// Undo the common hiding tricks: zero-width characters, spaced-out
    /// protocols, defanged `[dot]` notation, Cyrillic homoglyphs, unicode
    /// lookalike punctuation, percent-encoded separators.
    fn normalize(text: &str) -> String {
        let mut out: String = text
            .chars()
            .filter(|c| !matches!(c, '\u{200B}'..='\u{200F}' | '\u{2028}'..='\u{202E}' | '\u{FEFF}'))
            .map(|c| match c {
                'а' => 'a', 'о' => 'o', 'е' => 'e', 'р' => 'p', 'с' => 'c', 'х' => 'x',
                'А' => 'A', 'О' => 'O', 'Е' => 'E', 'Р' => 'P', 'С' => 'C', 'Х' => 'X',
                '․' | '‧' | '∙' | '•' | '·' => '.',
                '⁄' | '∕' | '╱' | '⧸' | '／' => '/',
                '：' | '﹕' => ':',
                _ => c,
            })
            .collect();

        let lower_fixups: &[(&str, &str)] = &[
            ("h t t p", "http"), ("ht tp", "http"), ("w w w .", "www."),
            ("[dot]", "."), ("(dot)", "."), ("{dot}", "."), ("<dot>", "."),
            ("[slash]", "/"), ("(slash)", "/"), ("{slash}", "/"), ("<slash>", "/"),
            ("[colon]", ":"), ("(colon)", ":"), ("{colon}", ":"), ("<colon>", ":"),
            ("[at]", "@"), ("(at)", "@"), ("{at}", "@"), ("<at>", "@"),
            ("%2f", "/"), ("%2F", "/"), ("%3a", ":"), ("%3A", ":"), ("%2e", "."), ("%2E", "."),
        ];
        for (from, to) in lower_fixups {
            if out.contains(from) {
                out = out.replace(from, to);
            }
        }
        out
    }

    fn any_reference(&self, text: &str) -> Vec<ReferenceKind> {
        let mut kinds = Vec::new();
        if self.urls.iter().any(|p| p.is_match(text)) {
            kinds.push(ReferenceKind::Url);
        }
        if self.ips.iter().any(|p| p.is_match(text)) {
            kinds.push(ReferenceKind::Ip);
        }
        if self.files.iter().any(|p| p.is_match(text)) {
            kinds.push(ReferenceKind::FilePath);
        }
        if self.commands.iter().any(|p| p.is_match(text)) {
            kinds.push(ReferenceKind::Command);
        }
        kinds
    }

    fn looks_like_reference(&self, decoded: &str) -> bool {
        if decoded.len() < 7 {
            return false;
        }
        self.urls.iter().any(|p| p.is_match(decoded))
            || self.ips.iter().any(|p| p.is_match(decoded))
    }

    /// Probe for references hidden behind an encoding layer.
    fn detect_encoding(&self, text: &str) -> Option<&'static str> {
        // Base64 candidates: long runs of base64 alphabet.
        for candidate in text
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='))
            .filter(|s| s.len() >= 30)
        {
            let trimmed = candidate.trim_end_matches('=');
            if trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/') {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(candidate) {
                    if let Ok(decoded) = String::from_utf8(bytes) {
                        if self.looks_like_reference(&decoded) {
                            return Some("base64");
                        }
                    }
                }
            }
        }

        // Hex candidates.
        for candidate in text
            .split(|c: char| !c.is_ascii_hexdigit())
            .filter(|s| s.len() >= 16 && s.len() % 2 == 0)
        {
            if let Some(decoded) = decode_hex(candidate) {
                if self.looks_like_reference(&decoded) {
                    return Some("hex");
                }
            }
        }

        // ROT13: decode the whole text and rescan.
        let rotated = rot13(text);
        if rotated != text && !self.any_reference(&rotated).is_empty() {
            return Some("rot13");
        }

        None
    }
}

impl Default for HeuristicReferenceClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClassifier for HeuristicReferenceClassifier {
    fn scan(&self, text: &str) -> ReferenceScan {
        let normalized = Self::normalize(text);
        let kinds = self.any_reference(&normalized);
        let encoding = self.detect_encoding(&normalized);

        // Normalization only counts as obfuscation when it uncovered a
        // reference that was not visible in the raw text.
        let obfuscated =
            normalized != text && !kinds.is_empty() && self.any_reference(text).is_empty();

        let has_references = !kinds.is_empty() || encoding.is_some();
        let action_verb =
            has_references && self.actions.iter().any(|p| p.is_match(&normalized));
        let sensitive_path = kinds.contains(&ReferenceKind::FilePath)
            && self.sensitive.iter().any(|p| p.is_match(&normalized));

        ReferenceScan {
            has_references,
            kinds,
            encoding,
            obfuscated,
            action_verb,
            sensitive_path,
        }
    }
}

fn decode_hex(candidate: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(candidate.len() / 2);
    let raw = candidate.as_bytes();
    for pair in raw.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    String::from_utf8(bytes).ok()
}

fn rot13(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a' + 13) % 26) + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A' + 13) % 26) + b'A') as char,
            _ => c,
        })
        .collect()
}
