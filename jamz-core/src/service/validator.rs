//! Inbound signaling payload checks
//!
//! Session ids arrive as `sessionId` or, from older clients, `session_id`.
//! Both are read explicitly; `sessionId` wins when both are present.

use jamz_sfu::SessionId;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::rate_limit::ConnectionId;
use crate::metrics;

pub const SESSION_ID_FIELD: &str = "sessionId";
pub const LEGACY_SESSION_ID_FIELD: &str = "session_id";
pub const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is not an object")]
    NotAnObject,

    #[error("missing sessionId")]
    MissingSessionId,

    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),

    #[error("connection has not joined session {0}")]
    NotJoined(SessionId),

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("unparseable frame: {0}")]
    Unparseable(String),
}

/// Cap `raw` at `max_chars` characters, marking the cut
#[must_use]
pub fn truncate_payload(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &raw[..cut]),
        None => raw.to_string(),
    }
}

fn id_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Session id from either accepted field name
pub fn extract_session_id(data: &Value) -> Result<SessionId, ValidationError> {
    let object = data.as_object().ok_or(ValidationError::NotAnObject)?;
    id_value(object.get(SESSION_ID_FIELD))
        .or_else(|| id_value(object.get(LEGACY_SESSION_ID_FIELD)))
        .map(SessionId::new)
        .ok_or(ValidationError::MissingSessionId)
}

#[derive(Debug, Clone)]
pub struct SignalingValidator {
    preview_len: usize,
}

impl Default for SignalingValidator {
    fn default() -> Self {
        Self::new(200)
    }
}

impl SignalingValidator {
    #[must_use]
    pub const fn new(preview_len: usize) -> Self {
        Self { preview_len }
    }

    #[must_use]
    pub const fn preview_len(&self) -> usize {
        self.preview_len
    }

    /// Session id of an inbound payload, or `None` after logging one
    /// truncated diagnostic.
    pub fn require_session_id(
        &self,
        data: &Value,
        connection_id: Option<&ConnectionId>,
    ) -> Option<SessionId> {
        match extract_session_id(data) {
            Ok(session_id) => Some(session_id),
            Err(e) => {
                self.report_malformed(data, connection_id, &e);
                None
            }
        }
    }

    /// Field that must be present and non-null
    pub fn require_field<'a>(
        &self,
        data: &'a Value,
        field: &'static str,
    ) -> Result<&'a Value, ValidationError> {
        data.get(field)
            .filter(|v| !v.is_null())
            .ok_or(ValidationError::MissingField(field))
    }

    /// Field that must be a non-empty string
    pub fn require_str<'a>(
        &self,
        data: &'a Value,
        field: &'static str,
    ) -> Result<&'a str, ValidationError> {
        self.require_field(data, field)?
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingField(field))
    }

    /// Log a dropped payload with its serialized form capped at the preview
    /// length
    pub fn report_malformed(
        &self,
        data: &Value,
        connection_id: Option<&ConnectionId>,
        error: &ValidationError,
    ) {
        metrics::signaling::MALFORMED_TOTAL.inc();
        let preview = truncate_payload(&data.to_string(), self.preview_len);
        let connection = connection_id.map_or("unknown", ConnectionId::as_str);
        warn!(
            connection_id = %connection,
            reason = %error,
            payload = %preview,
            "Malformed signaling payload from {connection} ({error})"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_accepts_both_field_names() {
        assert_eq!(
            extract_session_id(&json!({"sessionId": "s1"})).unwrap(),
            SessionId::from("s1")
        );
        assert_eq!(
            extract_session_id(&json!({"session_id": "s2"})).unwrap(),
            SessionId::from("s2")
        );
        assert_eq!(
            extract_session_id(&json!({"sessionId": "s1", "session_id": "s2"})).unwrap(),
            SessionId::from("s1")
        );
        assert_eq!(
            extract_session_id(&json!({"sessionId": 42})).unwrap(),
            SessionId::from("42")
        );
    }

    #[test]
    fn test_blank_session_id_falls_back_to_legacy_field() {
        assert_eq!(
            extract_session_id(&json!({"sessionId": " ", "session_id": "s2"})).unwrap(),
            SessionId::from("s2")
        );
    }

    #[test]
    fn test_rejects_missing_or_non_object() {
        assert_eq!(
            extract_session_id(&json!({"offer": {}})),
            Err(ValidationError::MissingSessionId)
        );
        assert_eq!(
            extract_session_id(&json!("s1")),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn test_truncate_payload() {
        assert_eq!(truncate_payload("short", 200), "short");
        let long = "x".repeat(250);
        let cut = truncate_payload(&long, 200);
        assert_eq!(cut.len(), 200 + TRUNCATION_MARKER.len());
        assert!(cut.ends_with(TRUNCATION_MARKER));
        // Multi-byte characters are never split
        assert_eq!(truncate_payload("ééé", 2), format!("éé{TRUNCATION_MARKER}"));
    }

    #[traced_test]
    #[test]
    fn test_missing_session_id_logs_one_truncated_line() {
        let validator = SignalingValidator::new(200);
        let payload = json!({ "candidate": "a".repeat(1000) });
        let conn = ConnectionId::from("conn-42");

        assert!(validator.require_session_id(&payload, Some(&conn)).is_none());

        logs_assert(|lines: &[&str]| {
            let hits: Vec<_> = lines
                .iter()
                .filter(|l| l.contains("Malformed signaling payload"))
                .collect();
            if hits.len() != 1 {
                return Err(format!("expected 1 diagnostic, got {}", hits.len()));
            }
            let line = hits[0];
            if !line.contains("conn-42") {
                return Err("connection id missing".to_string());
            }
            if !line.contains(TRUNCATION_MARKER) {
                return Err("truncation marker missing".to_string());
            }
            if line.contains(&"a".repeat(300)) {
                return Err("payload was not truncated".to_string());
            }
            Ok(())
        });
    }

    #[traced_test]
    #[test]
    fn test_valid_payload_logs_nothing() {
        let validator = SignalingValidator::default();
        let session = validator.require_session_id(&json!({"session_id": "s1"}), None);
        assert_eq!(session, Some(SessionId::from("s1")));
        assert!(!logs_contain("Malformed signaling payload"));
    }

    #[test]
    fn test_require_str() {
        let validator = SignalingValidator::default();
        let data = json!({"sdp": "v=0", "empty": "", "n": null});
        assert_eq!(validator.require_str(&data, "sdp").unwrap(), "v=0");
        assert_eq!(
            validator.require_str(&data, "empty"),
            Err(ValidationError::MissingField("empty"))
        );
        assert_eq!(
            validator.require_field(&data, "n"),
            Err(ValidationError::MissingField("n"))
        );
    }
}
