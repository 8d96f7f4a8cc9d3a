//! JSON text-frame codec for the control channel.
//!
//! Every control message travels as one WebSocket text frame holding a single
//! JSON object.

use crate::error::WarpResult;

/// Encode a serializable value into a JSON text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> WarpResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text frame into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> WarpResult<T> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WarpError;
    use crate::messages::Command;

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<Command>("not json").unwrap_err();
        assert!(matches!(err, WarpError::Codec(_)));
    }

    #[test]
    fn encode_produces_single_object() {
        let text = encode(&serde_json::json!({"type": "auth", "jwt": "j"})).unwrap();
        assert!(text.starts_with('{') && text.ends_with('}'));
        assert!(!text.contains('\n'));
    }
}
