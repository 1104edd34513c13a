//! Self-describing byte strings (`hex:...` / `base64:...`) used for keys and
//! signatures on the wire.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

const HEX_PREFIX: &str = "hex:";
const BASE64_PREFIX: &str = "base64:";

/// Buffers up to this size are written as hex, larger ones as base64.
pub const HEX_MAX_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing encoding prefix in {0:?}")]
    MissingPrefix(String),

    #[error("invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encode bytes, choosing hex for short buffers and base64 otherwise.
pub fn encode(bytes: &[u8]) -> String {
    if bytes.len() <= HEX_MAX_LEN {
        encode_hex(bytes)
    } else {
        encode_base64(bytes)
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    format!("{HEX_PREFIX}{}", hex::encode(bytes))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    format!("{BASE64_PREFIX}{}", BASE64.encode(bytes))
}

/// Decode a prefixed string back into bytes.
pub fn decode(value: &str) -> Result<Vec<u8>, CodecError> {
    if let Some(payload) = value.strip_prefix(HEX_PREFIX) {
        Ok(hex::decode(payload)?)
    } else if let Some(payload) = value.strip_prefix(BASE64_PREFIX) {
        Ok(BASE64.decode(payload)?)
    } else {
        Err(CodecError::MissingPrefix(value.to_string()))
    }
}

/// `#[serde(with = "shared::codec::safe_buffer")]` for `Vec<u8>` fields.
pub mod safe_buffer {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        super::decode(&value).map_err(D::Error::custom)
    }
}
