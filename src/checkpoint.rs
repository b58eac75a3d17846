//! Durable checkpoints kept in dedicated single-message streams.
//!
//! Each checkpoint lives in `@ce-checkpoint-{name}`. The stream's metadata
//! caps retention at one message, so the newest message *is* the
//! checkpoint. Payloads are the bare JSON number of the last processed
//! version or position.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stream::{
    AppendResult, ExpectedVersion, NewStreamMessage, StreamMessage, StreamStore, cancellable,
    last_message_of_stream,
};
use crate::stream_id::checkpoint_stream_id;

/// Message type of checkpoint records.
pub const CHECKPOINT_MESSAGE_TYPE: &str = "checkpoint";

/// Snapshot of a checkpoint stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointState {
    /// Last version of the checkpoint stream itself; `None` if it does not
    /// exist yet.
    pub stream_version: Option<u64>,
    /// The stored checkpoint value; `None` means "nothing processed".
    pub value: Option<u64>,
}

impl CheckpointState {
    /// Expected version for the next write to the checkpoint stream.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::from_last_version(self.stream_version)
    }
}

/// Reads and writes checkpoint streams.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn StreamStore>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Create a checkpoint store writing through `store`.
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }

    /// Read the checkpoint held in `stream_id` with one reverse read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deserialization`] if the newest message is not a
    /// non-negative integer.
    pub async fn read(&self, stream_id: &str, cancel: &CancellationToken) -> Result<CheckpointState> {
        let (stream_version, last) =
            last_message_of_stream(self.store.as_ref(), stream_id, cancel).await?;
        let value = last.as_ref().map(parse_checkpoint).transpose()?;
        Ok(CheckpointState {
            stream_version,
            value,
        })
    }

    /// Append `value` to `stream_id` at `expected`.
    ///
    /// Does not touch retention; see [`ensure_single_retention`](Self::ensure_single_retention).
    pub async fn write(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        value: u64,
        cancel: &CancellationToken,
    ) -> Result<AppendResult> {
        let message = checkpoint_message(value)?;
        let result = cancellable(
            cancel,
            self.store.append_to_stream(stream_id, expected, vec![message]),
        )
        .await?;
        tracing::trace!(stream_id, value, version = result.current_version, "checkpoint written");
        Ok(result)
    }

    /// Cap `stream_id` at one retained message unless a limit is already set.
    pub async fn ensure_single_retention(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let metadata = cancellable(cancel, self.store.get_stream_metadata(stream_id)).await?;
        if metadata.max_count.is_some() {
            return Ok(());
        }
        cancellable(
            cancel,
            self.store.set_stream_metadata(
                stream_id,
                ExpectedVersion::from_last_version(metadata.metadata_version),
                Some(1),
            ),
        )
        .await
    }

    /// Persist `value` under the checkpoint called `name`.
    ///
    /// Appends at the stream's observed last version, so a concurrent
    /// writer to the same checkpoint surfaces as
    /// [`Error::ConcurrencyConflict`].
    pub async fn save(&self, name: &str, value: u64, cancel: &CancellationToken) -> Result<()> {
        let stream_id = checkpoint_stream_id(name)?;
        self.ensure_single_retention(&stream_id, cancel).await?;
        let (last_version, _) =
            last_message_of_stream(self.store.as_ref(), &stream_id, cancel).await?;
        self.write(
            &stream_id,
            ExpectedVersion::from_last_version(last_version),
            value,
            cancel,
        )
        .await?;
        Ok(())
    }

    /// Load the checkpoint called `name`; `None` if it was never saved.
    pub async fn load(&self, name: &str, cancel: &CancellationToken) -> Result<Option<u64>> {
        let stream_id = checkpoint_stream_id(name)?;
        Ok(self.read(&stream_id, cancel).await?.value)
    }

    /// Delete the checkpoint stream `stream_id`. Missing streams are fine.
    pub async fn delete(&self, stream_id: &str, cancel: &CancellationToken) -> Result<()> {
        cancellable(
            cancel,
            self.store.delete_stream(stream_id, ExpectedVersion::Any),
        )
        .await
    }
}

fn checkpoint_message(value: u64) -> Result<NewStreamMessage> {
    let metadata = serde_json::json!({ "timestamp": Utc::now().to_rfc3339() });
    Ok(NewStreamMessage {
        message_id: Uuid::new_v4(),
        message_type: CHECKPOINT_MESSAGE_TYPE.to_owned(),
        json_data: serde_json::to_string(&value)?,
        json_metadata: serde_json::to_string(&metadata)?,
    })
}

/// Accepts `42` as well as `"42"`.
fn parse_checkpoint(message: &StreamMessage) -> Result<u64> {
    let parsed = match serde_json::from_str::<Value>(&message.json_data) {
        Ok(Value::Number(n)) => n.as_u64(),
        Ok(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::Deserialization(format!(
            "checkpoint in '{}' is not a version: {}",
            message.stream_id, message.json_data
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStreamStore, StoreCall};

    fn setup() -> (InMemoryStreamStore, CheckpointStore) {
        let memory = InMemoryStreamStore::new();
        let checkpoints = CheckpointStore::new(Arc::new(memory.clone()));
        (memory, checkpoints)
    }

    #[tokio::test]
    async fn missing_checkpoint_reads_as_empty() {
        let (_memory, checkpoints) = setup();
        let state = checkpoints
            .read("@ce-checkpoint-Foo", &CancellationToken::new())
            .await
            .expect("read");
        assert_eq!(state, CheckpointState::default());
        assert_eq!(state.expected_version(), ExpectedVersion::NoStream);
    }

    #[tokio::test]
    async fn save_then_load() {
        let (_memory, checkpoints) = setup();
        let cancel = CancellationToken::new();
        checkpoints.save("Foo", 17, &cancel).await.expect("save");
        checkpoints.save("@ce-Foo", 42, &cancel).await.expect("save again");
        assert_eq!(checkpoints.load("Foo", &cancel).await.expect("load"), Some(42));
    }

    #[tokio::test]
    async fn save_caps_retention_at_one_message() {
        let (memory, checkpoints) = setup();
        let cancel = CancellationToken::new();
        for value in 0..5 {
            checkpoints.save("Foo", value, &cancel).await.expect("save");
        }
        assert_eq!(memory.retained_count("@ce-checkpoint-Foo").await, 1);

        let metadata_writes = memory
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::SetMetadata { .. }))
            .count();
        assert_eq!(metadata_writes, 1);

        let state = checkpoints
            .read("@ce-checkpoint-Foo", &cancel)
            .await
            .expect("read");
        assert_eq!(state.stream_version, Some(4));
        assert_eq!(state.value, Some(4));
    }

    #[tokio::test]
    async fn string_payload_is_accepted() {
        let (memory, checkpoints) = setup();
        memory
            .append_to_stream(
                "@ce-checkpoint-Foo",
                ExpectedVersion::NoStream,
                vec![NewStreamMessage {
                    message_id: Uuid::new_v4(),
                    message_type: CHECKPOINT_MESSAGE_TYPE.into(),
                    json_data: "\"9\"".into(),
                    json_metadata: "{}".into(),
                }],
            )
            .await
            .expect("seed");
        let value = checkpoints
            .load("Foo", &CancellationToken::new())
            .await
            .expect("load");
        assert_eq!(value, Some(9));
    }

    #[tokio::test]
    async fn garbage_payload_is_rejected() {
        let (memory, checkpoints) = setup();
        memory
            .append_to_stream(
                "@ce-checkpoint-Foo",
                ExpectedVersion::NoStream,
                vec![NewStreamMessage {
                    message_id: Uuid::new_v4(),
                    message_type: CHECKPOINT_MESSAGE_TYPE.into(),
                    json_data: "{\"nope\":true}".into(),
                    json_metadata: "{}".into(),
                }],
            )
            .await
            .expect("seed");
        let err = checkpoints
            .load("Foo", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    #[tokio::test]
    async fn stale_write_conflicts() {
        let (_memory, checkpoints) = setup();
        let cancel = CancellationToken::new();
        checkpoints
            .write("@ce-checkpoint-Foo", ExpectedVersion::NoStream, 1, &cancel)
            .await
            .expect("first write");
        let err = checkpoints
            .write("@ce-checkpoint-Foo", ExpectedVersion::NoStream, 2, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());
    }

    #[tokio::test]
    async fn delete_missing_stream_is_ok() {
        let (_memory, checkpoints) = setup();
        checkpoints
            .delete("@ce-checkpoint-Nothing", &CancellationToken::new())
            .await
            .expect("delete");
    }
}
