//! Protocol tokens and response verification for external classifier calls.
//!
//! Every call to the inference provider carries a fresh numeric nonce that the
//! structured response must echo verbatim in its `validation_token` field. A
//! missing or mismatched token invalidates the response regardless of its
//! content: an attacker who hijacks the model's output cannot know the nonce,
//! so an echo failure means the response is untrustworthy, not merely wrong.
//!
//! Responses are additionally checked field-by-field against an explicit
//! schema before any field is read. Partial objects are never trusted.

use serde_json::Value;
use std::fmt;

/// Per-call nonce. Scope is a single external call; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolToken(u64);

impl ProtocolToken {
    pub fn mint() -> Self {
        // 53-bit cap keeps the token exactly representable as a JSON number
        // on the model side.
        ProtocolToken(rand::random::<u64>() >> 11)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProtocolToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ways a structured response can fail verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    UnparseableJson,
    MissingField(&'static str),
    WrongType(&'static str),
    TokenMismatch,
    ConfidenceOutOfRange,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::UnparseableJson => write!(f, "response is not parseable JSON"),
            ProtocolViolation::MissingField(name) => write!(f, "missing required field: {name}"),
            ProtocolViolation::WrongType(name) => write!(f, "invalid type for field: {name}"),
            ProtocolViolation::TokenMismatch => {
                write!(f, "validation token mismatch, possible prompt injection")
            }
            ProtocolViolation::ConfidenceOutOfRange => write!(f, "confidence out of range"),
        }
    }
}

/// Expected JSON type for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Number,
    String,
    Array,
}

/// One required field in a classifier's response contract.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Verify a parsed response against its field schema and expected token.
///
/// Checks, in order: every required field is present with the right JSON
/// type, the echoed `validation_token` matches, and any `confidence` field
/// lies in [0, 1].
pub fn verify_response(
    response: &Value,
    schema: &[FieldSpec],
    token: ProtocolToken,
) -> Result<(), ProtocolViolation> {
    let obj = response
        .as_object()
        .ok_or(ProtocolViolation::UnparseableJson)?;

    for field in schema {
        let value = obj
            .get(field.name)
            .ok_or(ProtocolViolation::MissingField(field.name))?;
        let ok = match field.kind {
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
            FieldKind::Array => value.is_array(),
        };
        if !ok {
            return Err(ProtocolViolation::WrongType(field.name));
        }
    }

    let echoed = obj
        .get("validation_token")
        .and_then(Value::as_u64)
        .ok_or(ProtocolViolation::MissingField("validation_token"))?;
    if echoed != token.value() {
        return Err(ProtocolViolation::TokenMismatch);
    }

    if let Some(confidence) = obj.get("confidence").and_then(Value::as_f64) {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ProtocolViolation::ConfidenceOutOfRange);
        }
    }

    Ok(())
}

/// Parse a model completion into JSON, tolerating the fences and prose
/// models wrap around it. Tries the raw content first, then strips markdown
/// code fences, then extracts the first `{...}` block.
pub fn extract_json(content: &str) -> Result<Value, ProtocolViolation> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let unfenced = trimmed
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }

    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&unfenced[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(ProtocolViolation::UnparseableJson)
}

/// Escape untrusted text for embedding as a JSON data field. Control
/// characters are stripped outright; serde handles the quoting.
pub fn sanitize_untrusted(input: &str) -> String {
    input.chars().filter(|c| !c.is_control() || *c == '\n' || *c == '\t').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &[FieldSpec] = &[
        FieldSpec::new("safe", FieldKind::Bool),
        FieldSpec::new("confidence", FieldKind::Number),
        FieldSpec::new("validation_token", FieldKind::Number),
    ];

    #[test]
    fn test_verify_ok() {
        let token = ProtocolToken::mint();
        let resp = json!({"safe": true, "confidence": 0.9, "validation_token": token.value()});
        assert!(verify_response(&resp, SCHEMA, token).is_ok());
    }

    #[test]
    fn test_verify_missing_field() {
        let token = ProtocolToken::mint();
        let resp = json!({"confidence": 0.9, "validation_token": token.value()});
        assert_eq!(
            verify_response(&resp, SCHEMA, token),
            Err(ProtocolViolation::MissingField("safe"))
        );
    }

    #[test]
    fn test_verify_wrong_type() {
        let token = ProtocolToken::mint();
        let resp = json!({"safe": "yes", "confidence": 0.9, "validation_token": token.value()});
        assert_eq!(
            verify_response(&resp, SCHEMA, token),
            Err(ProtocolViolation::WrongType("safe"))
        );
    }

    #[test]
    fn test_verify_token_mismatch() {
        let token = ProtocolToken::mint();
        let resp = json!({"safe": true, "confidence": 0.9, "validation_token": token.value() + 1});
        assert_eq!(
            verify_response(&resp, SCHEMA, token),
            Err(ProtocolViolation::TokenMismatch)
        );
    }

    #[test]
    fn test_verify_confidence_range() {
        let token = ProtocolToken::mint();
        let resp = json!({"safe": true, "confidence": 1.4, "validation_token": token.value()});
        assert_eq!(
            verify_response(&resp, SCHEMA, token),
            Err(ProtocolViolation::ConfidenceOutOfRange)
        );
    }

    #[test]
    fn test_extract_json_fenced() {
        let content = "```json\n{\"safe\": true}\n```";
        assert_eq!(extract_json(content).unwrap(), json!({"safe": true}));
    }

    #[test]
    fn test_extract_json_prose() {
        let content = "Here is my analysis: {\"safe\": false} as requested.";
        assert_eq!(extract_json(content).unwrap(), json!({"safe": false}));
    }

    #[test]
    fn test_extract_json_garbage() {
        assert!(extract_json("not json at all").is_err());
    }

    #[test]
    fn test_sanitize_strips_controls() {
        assert_eq!(sanitize_untrusted("a\u{0000}b\u{0007}c"), "abc");
        assert_eq!(sanitize_untrusted("line1\nline2"), "line1\nline2");
    }
}
