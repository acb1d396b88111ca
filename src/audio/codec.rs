//! # Audio Frame Codec
//!
//! Transcodes the wire representation of an audio payload into an in-memory
//! sample sequence. Two encodings are accepted:
//!
//! - **base64**: raw little-endian 32-bit float samples, base64-wrapped
//! - **json**: a flat JSON array of numbers (sent directly or as a string)
//!
//! This is purely a byte/array transcoding step; no resampling, channel
//! mixing, or normalization happens here.

use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Decode an `audio_data` payload into float samples.
///
/// ## Parameters:
/// - **payload**: the raw `audio_data` field of an envelope; a string for
///   base64, a string or array for json
/// - **encoding**: `"base64"` or `"json"`
///
/// ## Failure Modes:
/// - unsupported encoding name
/// - base64 payload that is not a string, does not decode, or decodes to a
///   byte count that is not a multiple of 4
/// - json payload that is not a flat array of numbers
pub fn decode_audio_data(payload: &serde_json::Value, encoding: &str) -> AppResult<Vec<f32>> {
    match encoding {
        "base64" => {
            let text = payload.as_str().ok_or_else(|| {
                AppError::AudioFormat("base64 payload must be a string".to_string())
            })?;
            decode_base64(text)
        }
        "json" => decode_json(payload),
        other => Err(AppError::AudioFormat(format!(
            "Unsupported encoding: {}",
            other
        ))),
    }
}

/// Encode float samples as base64-wrapped little-endian bytes.
///
/// The server replies with structured JSON rather than raw audio, so this is
/// only exercised by clients and tests, but it pins down the wire format the
/// decoder expects.
pub fn encode_base64(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        // Writing into a Vec cannot fail
        bytes.write_f32::<LittleEndian>(sample).unwrap();
    }
    STANDARD.encode(&bytes)
}

fn decode_base64(text: &str) -> AppResult<Vec<f32>> {
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| AppError::AudioFormat(format!("Invalid base64 payload: {}", e)))?;

    if bytes.len() % 4 != 0 {
        return Err(AppError::AudioFormat(format!(
            "Payload length {} is not a multiple of 4 bytes",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes.as_slice());
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

fn decode_json(payload: &serde_json::Value) -> AppResult<Vec<f32>> {
    // Clients may send the array inline or as a JSON-encoded string
    match payload {
        serde_json::Value::Array(values) => values.iter().map(json_number_to_f32).collect(),
        serde_json::Value::String(text) => {
            let parsed: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| AppError::AudioFormat(format!("Invalid JSON payload: {}", e)))?;
            match parsed {
                serde_json::Value::Array(values) => {
                    values.iter().map(json_number_to_f32).collect()
                }
                _ => Err(AppError::AudioFormat(
                    "JSON payload must be an array of numbers".to_string(),
                )),
            }
        }
        _ => Err(AppError::AudioFormat(
            "JSON payload must be an array of numbers".to_string(),
        )),
    }
}

fn json_number_to_f32(value: &serde_json::Value) -> AppResult<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| AppError::AudioFormat("JSON payload contains a non-numeric element".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base64_round_trip() {
        let samples = vec![0.0f32, 0.5, -0.5, 1.0, -1.0, 0.123_456];
        let encoded = encode_base64(&samples);
        let decoded = decode_audio_data(&json!(encoded), "base64").unwrap();

        assert_eq!(decoded.len(), samples.len());
        for (original, round_tripped) in samples.iter().zip(decoded.iter()) {
            assert!((original - round_tripped).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_base64_rejects_truncated_payload() {
        // Three raw bytes encode cleanly but are not a whole f32
        let encoded = STANDARD.encode([1u8, 2, 3]);
        let err = decode_audio_data(&json!(encoded), "base64").unwrap_err();
        assert!(err.to_string().contains("not a multiple of 4"));
    }

    #[test]
    fn test_base64_rejects_non_string_payload() {
        assert!(decode_audio_data(&json!([1, 2, 3]), "base64").is_err());
    }

    #[test]
    fn test_json_array_decodes() {
        let decoded = decode_audio_data(&json!([0.0, 0.25, -0.25]), "json").unwrap();
        assert_eq!(decoded, vec![0.0, 0.25, -0.25]);
    }

    #[test]
    fn test_json_string_payload_decodes() {
        let decoded = decode_audio_data(&json!("[0.5, -0.5]"), "json").unwrap();
        assert_eq!(decoded, vec![0.5, -0.5]);
    }

    #[test]
    fn test_json_rejects_non_numeric_elements() {
        let err = decode_audio_data(&json!([0.1, "oops", 0.2]), "json").unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let err = decode_audio_data(&json!("AAAA"), "hex").unwrap_err();
        assert!(err.to_string().contains("Unsupported encoding: hex"));
    }
}
