use serde_json::Value;
use thiserror::Error;

/// Upper bound for a single opaque media payload (DTLS/RTP parameters, capabilities).
pub const MAX_MEDIA_PARAMS_BYTES: usize = 64 * 1024;
/// Upper bound for client-supplied `appData`.
pub const MAX_APP_DATA_BYTES: usize = 4 * 1024;
/// Upper bound for a relayed message payload.
pub const MAX_MESSAGE_PAYLOAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be a JSON object")]
    NotAnObject { field: &'static str },
    #[error("{field} is too large (max {max} bytes, got {got})")]
    TooLarge {
        field: &'static str,
        max: usize,
        got: usize,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

/// Shape check for opaque media-engine payloads: a non-empty JSON object of bounded size.
/// The contents are never interpreted.
pub fn validate_media_params(field: &'static str, value: &Value) -> Result<(), ValidationError> {
    let obj = value
        .as_object()
        .ok_or(ValidationError::NotAnObject { field })?;
    if obj.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    ensure_size(field, value, MAX_MEDIA_PARAMS_BYTES)
}

/// `appData` may be absent or an object (possibly empty).
pub fn validate_app_data(value: Option<&Value>) -> Result<(), ValidationError> {
    let Some(value) = value else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }
    if !value.is_object() {
        return Err(ValidationError::NotAnObject { field: "appData" });
    }
    ensure_size("appData", value, MAX_APP_DATA_BYTES)
}

pub fn validate_message_payload(value: &Value) -> Result<(), ValidationError> {
    if value.is_null() {
        return Err(ValidationError::Empty { field: "payload" });
    }
    ensure_size("payload", value, MAX_MESSAGE_PAYLOAD_BYTES)
}

fn ensure_size(field: &'static str, value: &Value, max: usize) -> Result<(), ValidationError> {
    let got = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX);
    if got > max {
        return Err(ValidationError::TooLarge { field, max, got });
    }
    Ok(())
}
