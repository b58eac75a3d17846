//! Tunables recognised by the persistence, replay and subscription layers.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default page size for forward reads.
pub const DEFAULT_MAX_READ_STREAM_FORWARD: usize = 200;

/// Default "close enough" distance below which a stream catch-up is skipped.
pub const DEFAULT_SUBSCRIPTION_CHECKPOINT_DELTA: u64 = 50;

/// Default reconnect budget for each persistent subscription.
pub const DEFAULT_SUBSCRIPTION_RETRY_COUNT: u32 = 5;

/// Options shared by [`EventStore`](crate::EventStore) and its components.
///
/// Deserializable so hosts can embed it in their own configuration file;
/// missing keys fall back to the defaults.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::EventSourcingConfig;
///
/// let config = EventSourcingConfig {
///     subscription_retry_count: 10,
///     ..EventSourcingConfig::default()
/// };
/// assert_eq!(config.max_read_stream_forward, 200);
/// assert_eq!(config.subscription_retry_count, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventSourcingConfig {
    /// Number of messages requested per forward page.
    pub max_read_stream_forward: usize,

    /// When a stream is at most this many versions ahead of a checkpoint,
    /// catch-up replay is skipped and the live subscription covers the gap.
    pub subscription_checkpoint_delta: u64,

    /// Number of drops a persistent subscription survives before it is
    /// declared dead.
    pub subscription_retry_count: u32,
}

impl Default for EventSourcingConfig {
    fn default() -> Self {
        Self {
            max_read_stream_forward: DEFAULT_MAX_READ_STREAM_FORWARD,
            subscription_checkpoint_delta: DEFAULT_SUBSCRIPTION_CHECKPOINT_DELTA,
            subscription_retry_count: DEFAULT_SUBSCRIPTION_RETRY_COUNT,
        }
    }
}

impl EventSourcingConfig {
    /// Build a configuration from `EVENTFOLD_*` environment variables.
    ///
    /// Recognised variables:
    ///
    /// * `EVENTFOLD_MAX_READ_STREAM_FORWARD`
    /// * `EVENTFOLD_SUBSCRIPTION_CHECKPOINT_DELTA`
    /// * `EVENTFOLD_SUBSCRIPTION_RETRY_COUNT`
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set but does not
    /// parse, or if the page size is zero.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads values through
    /// `lookup`, which keeps tests free of process-wide env mutation.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_read_stream_forward = match lookup("EVENTFOLD_MAX_READ_STREAM_FORWARD") {
            Some(val) => val.parse::<usize>().map_err(|e| {
                Error::Configuration(format!(
                    "EVENTFOLD_MAX_READ_STREAM_FORWARD is not a valid usize: {e}"
                ))
            })?,
            None => defaults.max_read_stream_forward,
        };

        let subscription_checkpoint_delta = match lookup("EVENTFOLD_SUBSCRIPTION_CHECKPOINT_DELTA")
        {
            Some(val) => val.parse::<u64>().map_err(|e| {
                Error::Configuration(format!(
                    "EVENTFOLD_SUBSCRIPTION_CHECKPOINT_DELTA is not a valid u64: {e}"
                ))
            })?,
            None => defaults.subscription_checkpoint_delta,
        };

        let subscription_retry_count = match lookup("EVENTFOLD_SUBSCRIPTION_RETRY_COUNT") {
            Some(val) => val.parse::<u32>().map_err(|e| {
                Error::Configuration(format!(
                    "EVENTFOLD_SUBSCRIPTION_RETRY_COUNT is not a valid u32: {e}"
                ))
            })?,
            None => defaults.subscription_retry_count,
        };

        let config = Self {
            max_read_stream_forward,
            subscription_checkpoint_delta,
            subscription_retry_count,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make paging loops spin forever.
    pub fn validate(&self) -> Result<()> {
        if self.max_read_stream_forward == 0 {
            return Err(Error::Configuration(
                "max_read_stream_forward must be nonzero".into(),
            ));
        }
        Ok(())
    }
}
