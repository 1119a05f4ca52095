//! Payload encoding and the overflow column.
//!
//! The primary `payload` column holds serialized JSON up to the configured
//! length. Longer bodies go to `payload_nolimit` and the primary column holds
//! the sentinel, so exactly one of the two carries the real content.

use crate::error::{CoordError, Result};
use serde::Serialize;
use serde_json::Value;

pub const NOLIMIT_SENTINEL: &str = "nolimit";

/// Column values for one stored payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredPayload {
    pub payload: String,
    pub payload_nolimit: Option<String>,
}

pub(crate) fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CoordError::InvalidObject {
        message: format!("Invalid JSON for payload: {e}"),
        source: e,
    })
}

/// Split serialized JSON across the primary and overflow columns.
///
/// Length is counted in characters, not bytes.
pub(crate) fn place(serialized: String, max_length: usize) -> StoredPayload {
    if serialized.chars().count() > max_length {
        StoredPayload {
            payload: NOLIMIT_SENTINEL.to_string(),
            payload_nolimit: Some(serialized),
        }
    } else {
        StoredPayload {
            payload: serialized,
            payload_nolimit: None,
        }
    }
}

pub(crate) fn decode(id: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| CoordError::Corrupt {
        id: id.to_string(),
        reason: format!("payload is not valid JSON: {e}"),
    })
}
