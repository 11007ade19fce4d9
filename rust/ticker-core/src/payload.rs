//! Job payload encoding.
//!
//! Payloads are JSON. Compressed payloads are zstd level 3 behind a one-byte
//! tag; untagged bytes are read as plain JSON so payloads written by other
//! tools still decode.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{SchedulerError, SchedulerResult};

const TAG_PLAIN: u8 = 0x00;
const TAG_ZSTD: u8 = 0x01;
const ZSTD_LEVEL: i32 = 3;

/// Payload compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// Serialize `value` into payload bytes.
pub fn encode<T: Serialize>(value: &T, compression: Compression) -> SchedulerResult<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(json.len() + 1);
            out.push(TAG_PLAIN);
            out.extend_from_slice(&json);
            Ok(out)
        }
        Compression::Zstd => {
            let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)
                .map_err(|e| SchedulerError::Payload(format!("compression failed: {e}")))?;
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Recover the JSON bytes of a payload.
pub fn decode_raw(bytes: &[u8]) -> SchedulerResult<Vec<u8>> {
    match bytes.split_first() {
        None => Ok(Vec::new()),
        Some((&TAG_PLAIN, rest)) => Ok(rest.to_vec()),
        Some((&TAG_ZSTD, rest)) => zstd::decode_all(rest)
            .map_err(|e| SchedulerError::Payload(format!("decompression failed: {e}"))),
        Some(_) => Ok(bytes.to_vec()),
    }
}

/// Deserialize a payload into `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SchedulerResult<T> {
    let json = decode_raw(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Report {
        name: String,
        rows: Vec<u32>,
    }

    #[test]
    fn test_zstd_payload_is_smaller_for_repetitive_data() {
        let report = Report {
            name: "nightly".repeat(50),
            rows: vec![7; 500],
        };
        let plain = encode(&report, Compression::None).unwrap();
        let packed = encode(&report, Compression::Zstd).unwrap();
        assert!(packed.len() < plain.len());
        assert_eq!(decode::<Report>(&packed).unwrap(), report);
    }

    #[test]
    fn test_untagged_json_decodes() {
        let value: serde_json::Value = decode(br#"{"a":1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_corrupt_zstd_is_an_error() {
        let bytes = [TAG_ZSTD, 0xde, 0xad, 0xbe, 0xef];
        assert!(matches!(decode_raw(&bytes), Err(SchedulerError::Payload(_))));
    }
}
