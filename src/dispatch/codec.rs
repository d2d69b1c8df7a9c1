//! Versioned codecs for task parameters and callback responses.
//!
//! Every encoded value is wrapped in a small envelope so the receiving side can
//! tell which codec produced it:
//!
//! ```text
//! +---------+--------+----------------+-----------------+
//! | version | format | length (u32BE) | payload         |
//! |  1 byte | 1 byte |    4 bytes     | `length` bytes  |
//! +---------+--------+----------------+-----------------+
//! ```
//!
//! Two formats exist: JSON (`serde_json`) and a compact structured binary
//! form (`bincode`). Binary payloads only round-trip for types without
//! self-describing serde attributes (no internally tagged or untagged enums).

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::EncodedParams;
use crate::error::CodecError;

/// Current envelope version.
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 6;

/// Codec selector carried next to encoded parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Json,
    Binary,
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::Binary => "binary",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            CodecKind::Json => 1,
            CodecKind::Binary => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(CodecKind::Json),
            2 => Ok(CodecKind::Binary),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }

    /// Encodes `value` with this codec into dispatchable parameters.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<EncodedParams, CodecError> {
        let bytes = match self {
            CodecKind::Json => JsonCodec.encode(value)?,
            CodecKind::Binary => BinaryCodec.encode(value)?,
        };
        Ok(EncodedParams { codec: self, bytes })
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(CodecKind::Json),
            "binary" | "bincode" => Ok(CodecKind::Binary),
            other => Err(format!("unknown codec '{}'", other)),
        }
    }
}

/// A payload codec with a versioned envelope.
pub trait Codec {
    fn kind(&self) -> CodecKind;

    fn encode_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>;

    /// Encodes `value` and wraps it in an envelope.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(value)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            CodecError::Malformed(format!(
                "payload of {} bytes exceeds envelope limit",
                payload.len()
            ))
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(ENVELOPE_VERSION);
        out.push(self.kind().tag());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Opens an envelope produced by this codec.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let (kind, payload) = open_envelope(bytes)?;
        if kind != self.kind() {
            return Err(CodecError::Malformed(format!(
                "expected {} envelope, found {}",
                self.kind(),
                kind
            )));
        }
        self.decode_payload(payload)
    }
}

/// JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn encode_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Structured binary payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Binary
    }

    fn encode_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(value)?)
    }

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Decodes any envelope, picking the codec from its format byte.
pub fn decode_envelope<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (kind, payload) = open_envelope(bytes)?;
    match kind {
        CodecKind::Json => JsonCodec.decode_payload(payload),
        CodecKind::Binary => BinaryCodec.decode_payload(payload),
    }
}

fn open_envelope(bytes: &[u8]) -> Result<(CodecKind, &[u8]), CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Malformed(format!(
            "envelope of {} bytes is shorter than its header",
            bytes.len()
        )));
    }

    if bytes[0] != ENVELOPE_VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[0]));
    }

    let kind = CodecKind::from_tag(bytes[1])?;
    let len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(CodecError::Malformed(format!(
            "declared payload length {} but found {} bytes",
            len,
            payload.len()
        )));
    }

    Ok((kind, payload))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;
    use crate::dispatch::types::CleanupRequest;
    use crate::step::outcome::{CommandExecutionStatus, StepExecutionResult, TaskResponse};

    fn cleanup_request() -> CleanupRequest {
        CleanupRequest {
            account_id: "acct".to_string(),
            infra_ref_id: "infra-1".to_string(),
        }
    }

    #[test]
    fn test_envelope_header_layout() {
        let bytes = JsonCodec.encode(&cleanup_request()).unwrap();
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        assert_eq!(bytes[1], 1);
        let len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        assert_eq!(len, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_binary_response_decodes_through_envelope() {
        let mut output_vars = BTreeMap::new();
        output_vars.insert("VERSION".to_string(), "1.2.3".to_string());
        let response = TaskResponse::StepExecution(StepExecutionResult {
            status: CommandExecutionStatus::Success,
            output_vars,
            error_message: None,
        });

        let bytes = BinaryCodec.encode(&response).unwrap();
        let decoded: TaskResponse = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_encode_into_params_records_codec() {
        let params = CodecKind::Binary.encode(&cleanup_request()).unwrap();
        assert_eq!(params.codec, CodecKind::Binary);
        let back: CleanupRequest = BinaryCodec.decode(&params.bytes).unwrap();
        assert_eq!(back, cleanup_request());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = JsonCodec.encode(&cleanup_request()).unwrap();
        bytes[0] = 9;
        let err = decode_envelope::<CleanupRequest>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_rejects_truncated_envelope() {
        let bytes = JsonCodec.encode(&cleanup_request()).unwrap();
        let err = decode_envelope::<CleanupRequest>(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));

        let err = decode_envelope::<CleanupRequest>(&[1, 1]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_rejects_mismatched_codec() {
        let bytes = JsonCodec.encode(&cleanup_request()).unwrap();
        let err = BinaryCodec.decode::<CleanupRequest>(&bytes).unwrap_err();
        assert!(err.to_string().contains("expected binary"));
    }

    #[test]
    fn test_json_encoding_failure_is_reported() {
        // JSON object keys must be strings
        let mut unencodable = HashMap::new();
        unencodable.insert((1u8, 2u8), "value");
        let err = CodecKind::Json.encode(&unencodable).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn test_codec_kind_from_str() {
        assert_eq!("JSON".parse::<CodecKind>(), Ok(CodecKind::Json));
        assert_eq!("bincode".parse::<CodecKind>(), Ok(CodecKind::Binary));
        assert!("protobuf".parse::<CodecKind>().is_err());
    }
}
