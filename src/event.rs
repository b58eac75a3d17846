//! Domain event capability and the `(type name, version)` registry.
//!
//! Concrete events implement [`Event`], which names them and fixes their
//! schema version. Decoding works against an [`EventRegistry`] built at
//! startup: each registered type contributes a decode function keyed by its
//! name and version, so the codec never needs reflection to find a type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// A typed domain event.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::Event;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderPlaced {
///     total: u64,
/// }
///
/// impl Event for OrderPlaced {
///     const EVENT_TYPE: &'static str = "OrderPlaced";
/// }
///
/// assert_eq!(OrderPlaced::VERSION, 0);
/// ```
pub trait Event: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Registered type name written to every envelope. Must not be empty.
    const EVENT_TYPE: &'static str;

    /// Schema version written to the envelope metadata.
    const VERSION: u32 = 0;
}

/// Object-safe view of an [`Event`], used wherever events of different
/// types travel together (aggregate buffers, replay callbacks, observers).
pub trait DynEvent: fmt::Debug + Send + Sync + 'static {
    /// Registered type name.
    fn event_type(&self) -> &'static str;

    /// Schema version.
    fn version(&self) -> u32;

    /// Serialize the payload.
    fn to_json(&self) -> serde_json::Result<Value>;

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> DynEvent for E {
    fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }

    fn version(&self) -> u32 {
        E::VERSION
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn DynEvent {
    /// Borrow the concrete event if it is an `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Returns `true` if the event is an `E`.
    pub fn is<E: Event>(&self) -> bool {
        self.as_any().is::<E>()
    }
}

/// A decoded event of any registered type.
pub type BoxedEvent = Box<dyn DynEvent>;

/// Turns a payload into a concrete event.
type DecodeFn = fn(Value) -> serde_json::Result<BoxedEvent>;

fn decode_as<E: Event>(payload: Value) -> serde_json::Result<BoxedEvent> {
    let event: E = serde_json::from_value(payload)?;
    Ok(Box::new(event))
}

#[derive(Clone, Copy)]
struct Registration {
    type_id: TypeId,
    decode: DecodeFn,
}

/// Mapping from `(type name, version)` to a decode function.
#[derive(Clone, Default)]
pub struct EventRegistry {
    entries: HashMap<(String, u32), Registration>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("EventRegistry").field("types", &keys).finish()
    }
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `(E::EVENT_TYPE, E::VERSION)`.
    ///
    /// Registering the same type twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `E::EVENT_TYPE` is empty, or if a
    /// different type already claimed the same name and version.
    pub fn register<E: Event>(&mut self) -> Result<()> {
        if E::EVENT_TYPE.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "event type {} has no registered name",
                std::any::type_name::<E>()
            )));
        }
        let key = (E::EVENT_TYPE.to_owned(), E::VERSION);
        let registration = Registration {
            type_id: TypeId::of::<E>(),
            decode: decode_as::<E>,
        };
        match self.entries.get(&key) {
            Some(existing) if existing.type_id != registration.type_id => {
                Err(Error::Configuration(format!(
                    "'{}' version {} is already registered to another type",
                    key.0, key.1
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.entries.insert(key, registration);
                Ok(())
            }
        }
    }

    /// Returns `true` if a type is registered for `(event_type, version)`.
    pub fn contains(&self, event_type: &str, version: u32) -> bool {
        self.entries.contains_key(&(event_type.to_owned(), version))
    }

    /// Number of registered `(name, version)` pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode `payload` as the type registered for `(event_type, version)`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownEventType`] if nothing is registered for the pair.
    /// - [`Error::TypeMismatch`] if the payload does not fit the type.
    pub fn decode(&self, event_type: &str, version: u32, payload: Value) -> Result<BoxedEvent> {
        let registration = self
            .entries
            .get(&(event_type.to_owned(), version))
            .ok_or_else(|| Error::UnknownEventType {
                event_type: event_type.to_owned(),
                version,
            })?;
        (registration.decode)(payload).map_err(|e| Error::TypeMismatch {
            event_type: event_type.to_owned(),
            version,
            reason: e.to_string(),
        })
    }
}
