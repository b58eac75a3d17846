//! Stream identifier derivation.
//!
//! Every stream this crate touches is addressed by a plain string. The
//! functions here derive aggregate, category and checkpoint stream ids from
//! names and ids; none of them hold state.
//!
//! ```text
//! Order-0f8fad5b-d9cb-469f-a165-70867728950e   aggregate stream
//! @ce-Order                                    category stream
//! @ce-checkpoint-Order                         checkpoint of a category subscription
//! @ce-checkpoint-global                        global subscription checkpoint
//! ```

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Streams whose id starts with this prefix are reserved for the
/// infrastructure and never delivered to observers.
pub const SYSTEM_STREAM_PREFIX: &str = "@";

/// Marks a stream as a category projection stream.
pub const CATEGORY_PREFIX: &str = "@ce-";

/// Infix naming a checkpoint stream.
pub const CHECKPOINT_PREFIX: &str = "checkpoint";

/// Checkpoint name reserved for the subscription over the whole log.
pub const GLOBAL_CHECKPOINT_ID: &str = "global";

/// Matches a UUID, optionally braced and optionally without hyphens.
static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[({]?[a-f0-9]{8}-?([a-f0-9]{4}-?){3}[a-f0-9]{12}[})]?")
        .expect("uuid pattern is a valid regex")
});

fn require_non_empty<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(value)
}

/// Returns `true` if `stream_id` names an infrastructure stream.
pub fn is_system_stream_id(stream_id: &str) -> bool {
    stream_id.starts_with(SYSTEM_STREAM_PREFIX)
}

/// Stream id of one aggregate instance: `{type_name}-{id}`.
///
/// # Arguments
///
/// * `type_name` - The aggregate type, e.g. `"Order"`.
/// * `id` - The aggregate instance id.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `type_name` is empty.
pub fn aggregate_stream_id(type_name: &str, id: Uuid) -> Result<String> {
    let type_name = require_non_empty(type_name, "aggregate type name")?;
    Ok(format!("{type_name}-{id}"))
}

/// Qualifies `id` as a category stream by prepending [`CATEGORY_PREFIX`].
///
/// Idempotent: an id that already carries the prefix is returned as is.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `id` is empty.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::stream_id::category_stream_id;
///
/// let once = category_stream_id("Order").unwrap();
/// assert_eq!(once, "@ce-Order");
/// assert_eq!(category_stream_id(&once).unwrap(), once);
/// ```
pub fn category_stream_id(id: &str) -> Result<String> {
    let id = require_non_empty(id, "stream id")?;
    if id.starts_with(CATEGORY_PREFIX) {
        Ok(id.to_owned())
    } else {
        Ok(format!("{CATEGORY_PREFIX}{id}"))
    }
}

/// Stream id holding the checkpoint named `id`.
///
/// The category prefix and any existing `checkpoint-` infix are stripped
/// before the id is rebuilt, so the derivation is idempotent and
/// `"Foo"`, `"@ce-Foo"` and `"@ce-checkpoint-Foo"` all map to
/// `"@ce-checkpoint-Foo"`. Checkpoint streams are therefore always system
/// streams.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `id` is empty, or if nothing is
/// left once the prefixes are stripped.
pub fn checkpoint_stream_id(id: &str) -> Result<String> {
    let id = require_non_empty(id, "checkpoint name")?;
    let base = id.strip_prefix(CATEGORY_PREFIX).unwrap_or(id);
    let infix = format!("{CHECKPOINT_PREFIX}-");
    let base = base.strip_prefix(infix.as_str()).unwrap_or(base);
    let base = require_non_empty(base, "checkpoint name")?;
    Ok(format!("{CATEGORY_PREFIX}{infix}{base}"))
}

/// Category stream an aggregate stream projects into.
///
/// Removes every UUID-shaped substring from `stream_id`, prefixes the rest
/// with [`CATEGORY_PREFIX`] and truncates at the last remaining `-`. A
/// stream id without a type-name separator keeps its full name.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `stream_id` is empty.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::stream_id::category_of;
///
/// let category = category_of("Order-0f8fad5b-d9cb-469f-a165-70867728950e").unwrap();
/// assert_eq!(category, "@ce-Order");
/// ```
pub fn category_of(stream_id: &str) -> Result<String> {
    let stream_id = require_non_empty(stream_id, "stream id")?;
    let stripped = UUID_PATTERN.replace_all(stream_id, "");
    let qualified = format!("{CATEGORY_PREFIX}{stripped}");
    match qualified.rfind('-') {
        Some(idx) if idx >= CATEGORY_PREFIX.len() => Ok(qualified[..idx].to_owned()),
        _ => Ok(qualified),
    }
}
