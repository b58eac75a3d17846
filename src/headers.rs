//! Caller-supplied headers stamped onto event envelopes.

use serde_json::{Map, Value};

/// Well-known header carrying the identity that caused the events.
pub const ACTOR_KEY: &str = "actor";

/// Well-known header correlating events across aggregates and services.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Headers merged into each envelope's metadata on save.
///
/// Infrastructure keys (`version`, `timestamp`) are added by the codec; a
/// caller-supplied `timestamp` wins, a caller-supplied `version` does not.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::EventHeaders;
/// use serde_json::json;
///
/// let headers = EventHeaders::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_header("source", json!("api"));
///
/// assert_eq!(headers.get("actor"), Some(&json!("user-42")));
/// assert_eq!(headers.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventHeaders {
    entries: Map<String, Value>,
}

impl EventHeaders {
    /// Set the actor identity.
    pub fn with_actor(self, actor: impl Into<String>) -> Self {
        self.with_header(ACTOR_KEY, Value::String(actor.into()))
    }

    /// Set the correlation id.
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header(CORRELATION_ID_KEY, Value::String(id.into()))
    }

    /// Set an arbitrary header, replacing any previous value for `key`.
    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    /// Look up a header.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no header is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy of the headers as a JSON object, ready for merging.
    pub(crate) fn to_map(&self) -> Map<String, Value> {
        self.entries.clone()
    }
}

impl From<Map<String, Value>> for EventHeaders {
    fn from(entries: Map<String, Value>) -> Self {
        Self { entries }
    }
}
