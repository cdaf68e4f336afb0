//! Payload encoding and decoding.
//!
//! Structured records are stored as JSON; binary payloads are stored as raw
//! bytes. Payloads written by the legacy engine used a length-prefixed
//! object-graph serializer whose frames start with a marker byte; decoding
//! those is refused outright and surfaced as a distinct error, since the
//! format can encode arbitrary object graphs and was flagged as untrusted
//! during migration.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StorageError;

/// Leading marker byte of legacy object-graph frames.
pub const LEGACY_FRAME_MARKER: u8 = 0x80;

/// Returns true if the payload looks like a legacy object-graph frame.
pub fn is_legacy_payload(bytes: &[u8]) -> bool {
    bytes.first() == Some(&LEGACY_FRAME_MARKER)
}

/// Encode a structured record as JSON bytes.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Corrupt {
        key: String::new(),
        reason: format!("failed to serialize record: {}", e),
    })
}

/// Decode a structured record from JSON bytes.
///
/// Legacy object-graph payloads are detected before any parsing happens and
/// refused with [`StorageError::LegacyPayload`]; they are never interpreted.
pub fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StorageError> {
    if is_legacy_payload(bytes) {
        return Err(StorageError::LegacyPayload(key.to_string()));
    }

    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
