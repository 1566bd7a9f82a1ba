//! The persisted session record: `{"format_version": 1, "state": {...}}`.

use cortex_core::SessionState;
use cortex_core::error::MemoryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct RecordRef<'a> {
    format_version: u32,
    state: &'a SessionState,
}

#[derive(Deserialize)]
struct Record {
    state: SessionState,
}

pub fn encode(state: &SessionState) -> Result<String, MemoryError> {
    serde_json::to_string(&RecordRef {
        format_version: FORMAT_VERSION,
        state,
    })
    .map_err(|e| MemoryError::Storage(format!("Failed to serialize session: {e}")))
}

/// Parse a stored record, rejecting versions this build does not know.
pub fn decode(session_id: &str, raw: &str) -> Result<SessionState, MemoryError> {
    let corrupted = |reason: String| MemoryError::Corrupted {
        session_id: session_id.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(raw).map_err(|e| corrupted(e.to_string()))?;
    let version = value
        .get("format_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| corrupted("missing format_version".into()))?;
    if version != u64::from(FORMAT_VERSION) {
        return Err(MemoryError::UnsupportedVersion {
            found: u32::try_from(version).unwrap_or(u32::MAX),
            expected: FORMAT_VERSION,
        });
    }

    let record: Record = serde_json::from_value(value).map_err(|e| corrupted(e.to_string()))?;
    if record.state.session_id != session_id {
        return Err(corrupted(format!(
            "record belongs to session '{}'",
            record.state.session_id
        )));
    }
    Ok(record.state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_record_carries_version() {
        let state = SessionState::new("chat-1");
        let raw = encode(&state).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["format_version"], 1);
        assert_eq!(value["state"]["session_id"], "chat-1");
        assert_eq!(decode("chat-1", &raw).unwrap(), state);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let raw = r#"{"format_version": 2, "state": {"session_id": "chat-1"}}"#;
        let err = decode("chat-1", raw).unwrap_err();
        assert!(matches!(err, MemoryError::UnsupportedVersion { found: 2, expected: 1 }));
    }

    #[test]
    fn garbage_is_corrupted() {
        assert!(matches!(
            decode("s", "not json").unwrap_err(),
            MemoryError::Corrupted { .. }
        ));
        assert!(matches!(
            decode("s", r#"{"state": {"session_id": "s"}}"#).unwrap_err(),
            MemoryError::Corrupted { .. }
        ));
        assert!(matches!(
            decode("s", r#"{"format_version": 1, "state": {"session_id": "other"}}"#).unwrap_err(),
            MemoryError::Corrupted { .. }
        ));
    }
}
