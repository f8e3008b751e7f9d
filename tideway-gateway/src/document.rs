//! Incoming document model and body helpers.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use error_stack::{Report, ResultExt};
use serde_json::Value;

use tideway_core::{Body, HandlerError};

/// A document under construction from an inbound `rev` message. Built,
/// patched, reconciled, persisted once, then discarded.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub id: String,
    pub rev_id: String,
    pub deleted: bool,
    pub expiry: Option<DateTime<Utc>>,
    pub attachments: Option<Body>,
    body_bytes: Bytes,
    body: Option<Body>,
}

impl Document {
    #[must_use]
    pub fn new(id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev_id: rev_id.into(),
            ..Self::default()
        }
    }

    /// Replaces the raw body; any parsed form is discarded.
    pub fn update_body_bytes(&mut self, bytes: Bytes) {
        self.body_bytes = bytes;
        self.body = None;
    }

    /// Replaces the parsed body; it becomes authoritative over the raw
    /// bytes.
    pub fn update_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.body_bytes.len()
    }

    /// The parsed body, unmarshalling the raw bytes on first access. An
    /// empty raw body parses as an empty object.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the raw bytes are not a JSON object.
    pub fn body(&mut self) -> Result<&mut Body, Report<HandlerError>> {
        if self.body.is_none() {
            let parsed = if self.body_bytes.is_empty() {
                Body::new()
            } else {
                serde_json::from_slice(&self.body_bytes)
                    .change_context(HandlerError::internal("unable to unmarshal document body"))?
            };
            self.body = Some(parsed);
        }
        Ok(self.body.as_mut().expect("body just populated"))
    }

    /// The parsed body, consuming the document.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the raw bytes are not a JSON object.
    pub fn into_body(mut self) -> Result<Body, Report<HandlerError>> {
        self.body()?;
        Ok(self.body.expect("body just populated"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryError;

impl fmt::Display for ExpiryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid expiry value")
    }
}

impl std::error::Error for ExpiryError {}

/// Values at or above this many seconds are absolute unix timestamps;
/// smaller values are durations relative to now.
const EXPIRY_RELATIVE_CUTOFF_SECS: i64 = 60 * 60 * 24 * 30;

fn expiry_from_seconds(secs: i64) -> Result<DateTime<Utc>, ExpiryError> {
    if secs < 0 {
        return Err(ExpiryError);
    }
    if secs >= EXPIRY_RELATIVE_CUTOFF_SECS {
        DateTime::<Utc>::from_timestamp(secs, 0).ok_or(ExpiryError)
    } else {
        Ok(Utc::now() + TimeDelta::seconds(secs))
    }
}

/// Parses a reserved `_exp` value: integer seconds (absolute or
/// now-relative below a 30-day cutoff) or an RFC3339 timestamp.
///
/// # Errors
///
/// Returns [`ExpiryError`] for any other shape.
pub fn parse_expiry(value: &Value) -> Result<DateTime<Utc>, ExpiryError> {
    match value {
        Value::Number(n) => expiry_from_seconds(n.as_i64().ok_or(ExpiryError)?),
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            let secs = s.parse::<i64>().map_err(|_| ExpiryError)?;
            expiry_from_seconds(secs)
        }
        _ => Err(ExpiryError),
    }
}

/// The generation number of a `<gen>-<suffix>` revision ID, if parseable.
#[must_use]
pub fn rev_generation(rev_id: &str) -> Option<u64> {
    let (generation, _) = rev_id.split_once('-')?;
    generation.parse().ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn body_parses_lazily() {
        let mut doc = Document::new("doc1", "1-a");
        doc.update_body_bytes(Bytes::from_static(br#"{"x":1}"#));
        assert_eq!(doc.body().unwrap().get("x"), Some(&json!(1)));
    }

    #[test]
    fn empty_body_parses_as_empty_object() {
        let mut doc = Document::new("doc1", "1-a");
        assert!(doc.body().unwrap().is_empty());
    }

    #[test]
    fn garbage_body_is_internal_error() {
        let mut doc = Document::new("doc1", "1-a");
        doc.update_body_bytes(Bytes::from_static(b"not json"));
        let err = doc.body().unwrap_err();
        assert_eq!(err.current_context().code(), Some(500));
    }

    #[test]
    fn update_body_overrides_raw_bytes() {
        let mut doc = Document::new("doc1", "2-b");
        doc.update_body_bytes(Bytes::from_static(br#"{"x":1}"#));
        let mut patched = Body::new();
        patched.insert("x".to_string(), json!(2));
        doc.update_body(patched);
        assert_eq!(doc.body().unwrap().get("x"), Some(&json!(2)));
    }

    #[test]
    fn expiry_absolute_seconds() {
        let ts = parse_expiry(&json!(4_000_000_000_i64)).unwrap();
        assert_eq!(ts.timestamp(), 4_000_000_000);
    }

    #[test]
    fn expiry_relative_seconds() {
        let before = Utc::now();
        let ts = parse_expiry(&json!(60)).unwrap();
        assert!(ts >= before + TimeDelta::seconds(59));
        assert!(ts <= Utc::now() + TimeDelta::seconds(61));
    }

    #[test]
    fn expiry_rfc3339_string() {
        let ts = parse_expiry(&json!("2030-06-01T12:00:00Z")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2030-06-01T12:00:00+00:00");
    }

    #[test]
    fn expiry_numeric_string() {
        let ts = parse_expiry(&json!("4000000000")).unwrap();
        assert_eq!(ts.timestamp(), 4_000_000_000);
    }

    #[test]
    fn expiry_rejects_other_shapes() {
        assert_eq!(parse_expiry(&json!(["x"])), Err(ExpiryError));
        assert_eq!(parse_expiry(&json!("tomorrow")), Err(ExpiryError));
        assert_eq!(parse_expiry(&json!(-5)), Err(ExpiryError));
    }

    #[test]
    fn rev_generation_parses_leading_number() {
        assert_eq!(rev_generation("3-abc"), Some(3));
        assert_eq!(rev_generation("12-ff00"), Some(12));
        assert_eq!(rev_generation("nodash"), None);
        assert_eq!(rev_generation("x-abc"), None);
    }
}
