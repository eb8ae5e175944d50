// =============================================================================
// Broadcast Sanitisation — keep every outbound frame a plain text frame
// =============================================================================
//
// Outbound messages are uncompressed single-frame textual JSON. Before a
// message is queued, nested values that cannot be represented faithfully
// (non-finite numbers, pathologically deep nesting) are replaced with the
// literal string "[Non-serializable]". Before a batch is sent it is shape-
// validated; malformed batches are counted and dropped rather than shipped.
// =============================================================================

use serde_json::{Map, Value};
use tracing::warn;

/// Replacement literal for values that cannot be serialised faithfully.
pub const NON_SERIALIZABLE: &str = "[Non-serializable]";
/// First byte of a gzip stream; outbound frames must never start with it.
pub const GZIP_MAGIC: u8 = 0x1F;
/// Warn when a serialised batch exceeds this many bytes.
pub const MAX_BATCH_BYTES: usize = 1_048_576;
/// Depth beyond which nested values are replaced wholesale.
const MAX_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// Value sanitisation
// ---------------------------------------------------------------------------

/// Recursively sanitise a JSON value for broadcast.
pub fn sanitize_value(value: &Value) -> Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(NON_SERIALIZABLE.to_string());
    }

    match value {
        Value::Number(n) => {
            // serde_json numbers are finite by construction; a float that
            // failed conversion upstream arrives as Null instead.
            Value::Number(n.clone())
        }
        Value::Null => Value::String(NON_SERIALIZABLE.to_string()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_at_depth(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), sanitize_at_depth(item, depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Batch validation
// ---------------------------------------------------------------------------

/// Why a batch message was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    NotAnObject,
    MissingSimulationId,
    WrongEventType,
    MissingUpdates,
    MissingUpdateCount,
    ForbiddenTypeKey,
    CompressedPayload,
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotAnObject => "message is not an object",
            Self::MissingSimulationId => "missing simulationId",
            Self::WrongEventType => "event.type is not batch_update",
            Self::MissingUpdates => "event.data.updates is not an object",
            Self::MissingUpdateCount => "event.data.updateCount is not a number",
            Self::ForbiddenTypeKey => "event.data contains forbidden type key",
            Self::CompressedPayload => "serialised form begins with gzip magic",
        };
        write!(f, "{s}")
    }
}

/// Validate a batch envelope and return its serialised form.
///
/// Checks: object shape, `simulationId`, `event.type == "batch_update"`,
/// `event.data.updates` object, `event.data.updateCount` number, no `type`
/// key inside `event.data`, no gzip-magic prefix. Oversized batches are
/// allowed through with a warning.
pub fn validate_batch(message: &Value) -> Result<String, BatchError> {
    let obj = message.as_object().ok_or(BatchError::NotAnObject)?;

    if !obj.get("simulationId").is_some_and(Value::is_string) {
        return Err(BatchError::MissingSimulationId);
    }

    let event = obj
        .get("event")
        .and_then(Value::as_object)
        .ok_or(BatchError::NotAnObject)?;

    if event.get("type").and_then(Value::as_str) != Some("batch_update") {
        return Err(BatchError::WrongEventType);
    }

    let data = event
        .get("data")
        .and_then(Value::as_object)
        .ok_or(BatchError::MissingUpdates)?;

    // A `type` key inside the data object would let clients mis-dispatch
    // the batch as a plain event.
    if data.contains_key("type") {
        return Err(BatchError::ForbiddenTypeKey);
    }

    if !data.get("updates").is_some_and(Value::is_object) {
        return Err(BatchError::MissingUpdates);
    }
    if !data.get("updateCount").is_some_and(Value::is_number) {
        return Err(BatchError::MissingUpdateCount);
    }

    let serialised =
        serde_json::to_string(message).map_err(|_| BatchError::NotAnObject)?;

    if serialised.as_bytes().first() == Some(&GZIP_MAGIC) {
        return Err(BatchError::CompressedPayload);
    }
    if serialised.len() > MAX_BATCH_BYTES {
        warn!(
            bytes = serialised.len(),
            "batch message exceeds 1 MB — sending anyway"
        );
    }

    Ok(serialised)
}

// =============================================================================
// Tests
// =============================================================================
