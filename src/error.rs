//! Crate-level error type shared by persistence, replay and subscriptions.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the event-sourcing layer can surface.
///
/// Decode and append failures propagate synchronously to the immediate
/// caller. [`Error::SubscriptionDropped`] is only produced internally to
/// drive reconnection and is never returned from a public operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An event type lacks the registration metadata needed to encode it.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No registered event type matches the `(type name, version)` pair.
    #[error("unknown event type '{event_type}' (version {version})")]
    UnknownEventType {
        /// Type name read from the message envelope.
        event_type: String,
        /// Schema version read from the message metadata.
        version: u32,
    },

    /// The payload could not be shaped into the registered event type.
    #[error("payload for '{event_type}' (version {version}) does not match the registered type: {reason}")]
    TypeMismatch {
        /// Type name read from the message envelope.
        event_type: String,
        /// Schema version read from the message metadata.
        version: u32,
        /// The underlying deserializer complaint.
        reason: String,
    },

    /// Envelope metadata or payload text could not be parsed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Encoding a payload or header map failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The append's expected version did not match the stream.
    #[error("concurrency conflict on '{stream_id}': expected {expected}, actual {actual}")]
    ConcurrencyConflict {
        /// Stream the append targeted.
        stream_id: String,
        /// Expected version supplied by the caller.
        expected: String,
        /// Version the stream was actually at.
        actual: String,
    },

    /// Zero events were found for the requested aggregate.
    #[error("aggregate not found: {stream_id}")]
    AggregateNotFound {
        /// The aggregate stream that was read.
        stream_id: String,
    },

    /// A live subscription stopped delivering.
    #[error("subscription '{name}' dropped: {reason}")]
    SubscriptionDropped {
        /// Subscription name as registered with the store.
        name: String,
        /// Why the drop happened.
        reason: String,
    },

    /// Generic setup failure inside the subscription machinery.
    #[error("application error: {0}")]
    Application(String),

    /// A required argument was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other failure reported by the stream store collaborator.
    #[error("stream store error: {0}")]
    Store(String),

    /// The operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` for optimistic-concurrency failures.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_type_display() {
        let err = Error::UnknownEventType {
            event_type: "TestEvent".into(),
            version: 2,
        };
        assert_eq!(err.to_string(), "unknown event type 'TestEvent' (version 2)");
    }

    #[test]
    fn concurrency_conflict_display_and_predicate() {
        let err = Error::ConcurrencyConflict {
            stream_id: "Test-1".into(),
            expected: "no stream".into(),
            actual: "3".into(),
        };
        assert_eq!(
            err.to_string(),
            "concurrency conflict on 'Test-1': expected no stream, actual 3"
        );
        assert!(err.is_concurrency_conflict());
        assert!(!Error::Cancelled.is_concurrency_conflict());
    }

    #[test]
    fn serialization_from_serde_json() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(serde_err);
        assert!(err.to_string().starts_with("serialization error:"));
    }

    #[test]
    fn aggregate_not_found_display() {
        let err = Error::AggregateNotFound {
            stream_id: "Order-abc".into(),
        };
        assert_eq!(err.to_string(), "aggregate not found: Order-abc");
    }

    #[test]
    fn cancelled_display() {
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }

    // Errors cross task boundaries inside subscription loops.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<Error>();
        }
    };
}
