//! Encoding events into stream-store envelopes and back.
//!
//! An envelope carries the event's registered type name as the message
//! type, the serialized payload, and a metadata map holding at least the
//! schema `version` and a `timestamp`. Payload and metadata text go through
//! a pluggable [`Serializer`]; [`JsonSerializer`] is the default.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{BoxedEvent, DynEvent, EventRegistry};
use crate::headers::EventHeaders;
use crate::stream::{NewStreamMessage, StreamMessage};
use crate::stream_id::is_system_stream_id;

/// Metadata key holding the event's schema version.
pub const VERSION_KEY: &str = "version";

/// Metadata key holding the UTC time the envelope was built.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Converts structured values to and from the text stored in envelopes.
pub trait Serializer: Send + Sync {
    /// Render `value` as text.
    fn serialize(&self, value: &Value) -> Result<String>;

    /// Parse text produced by [`serialize`](Serializer::serialize).
    fn deserialize(&self, text: &str) -> Result<Value>;
}

/// `serde_json` text serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, text: &str) -> Result<Value> {
        serde_json::from_str(text).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Returns `true` if `message` belongs to an infrastructure stream.
pub fn is_system_stream(message: &StreamMessage) -> bool {
    is_system_stream_id(&message.stream_id)
}

/// Envelope encoder and decoder bound to an [`EventRegistry`].
///
/// `Clone` is cheap: the registry and serializer are `Arc`-wrapped.
#[derive(Clone)]
pub struct EventCodec {
    registry: Arc<EventRegistry>,
    serializer: Arc<dyn Serializer>,
}

impl fmt::Debug for EventCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCodec")
            .field("registry", &self.registry)
            .finish()
    }
}

impl EventCodec {
    /// Codec using [`JsonSerializer`].
    pub fn new(registry: EventRegistry) -> Self {
        Self::with_serializer(registry, Arc::new(JsonSerializer))
    }

    /// Codec using a custom serializer.
    pub fn with_serializer(registry: EventRegistry, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            registry: Arc::new(registry),
            serializer,
        }
    }

    /// The registry decoding resolves against.
    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Build an envelope for `event`.
    ///
    /// Caller headers are merged with `version` (always overwritten) and
    /// `timestamp` (only added when absent). A fresh message id is
    /// generated on every call.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if the event type has no name.
    /// - [`Error::Serialization`] if the payload cannot be serialized.
    pub fn to_envelope(
        &self,
        event: &dyn DynEvent,
        headers: Option<&EventHeaders>,
    ) -> Result<NewStreamMessage> {
        let event_type = event.event_type();
        if event_type.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "event {event:?} has no registered type name"
            )));
        }

        let mut metadata = headers.map(EventHeaders::to_map).unwrap_or_default();
        metadata.insert(VERSION_KEY.to_owned(), Value::from(event.version()));
        metadata
            .entry(TIMESTAMP_KEY)
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        let payload = event.to_json()?;
        Ok(NewStreamMessage {
            message_id: Uuid::new_v4(),
            message_type: event_type.to_owned(),
            json_data: self.serializer.serialize(&payload)?,
            json_metadata: self.serializer.serialize(&Value::Object(metadata))?,
        })
    }

    /// Decode `message` into the event type registered for its type name
    /// and schema version.
    ///
    /// # Errors
    ///
    /// - [`Error::Deserialization`] if the metadata or payload text cannot be
    ///   parsed, or the version is present but not a non-negative integer.
    /// - [`Error::UnknownEventType`] if no type matches.
    /// - [`Error::TypeMismatch`] if the payload does not fit the type.
    pub fn from_envelope(&self, message: &StreamMessage) -> Result<BoxedEvent> {
        let version = self.schema_version(message)?;
        let payload = self.serializer.deserialize(&message.json_data)?;
        self.registry
            .decode(&message.message_type, version, payload)
    }

    /// Non-failing metadata lookup. Returns `None` if the key is absent or
    /// the metadata cannot be parsed.
    pub fn try_get_metadata(&self, message: &StreamMessage, key: &str) -> Option<Value> {
        let metadata = self.metadata_map(message).ok()?;
        metadata.get(key).cloned()
    }

    fn metadata_map(&self, message: &StreamMessage) -> Result<Map<String, Value>> {
        if message.json_metadata.trim().is_empty() {
            return Ok(Map::new());
        }
        match self.serializer.deserialize(&message.json_metadata)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(Error::Deserialization(format!(
                "metadata of message {} is not an object: {other}",
                message.message_id
            ))),
        }
    }

    fn schema_version(&self, message: &StreamMessage) -> Result<u32> {
        let metadata = self.metadata_map(message)?;
        let Some(raw) = metadata.get(VERSION_KEY) else {
            return Ok(0);
        };
        let parsed = match raw {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            Value::Null => Some(0),
            _ => None,
        };
        parsed.ok_or_else(|| {
            Error::Deserialization(format!(
                "message {} has an unparsable version: {raw}",
                message.message_id
            ))
        })
    }
}
