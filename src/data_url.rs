//! Data-URL codec for browser-submitted frames
//!
//! Clients send frames as `data:image/jpeg;base64,<payload>`. Only the
//! segment after the comma is decoded; the media type prefix is not
//! interpreted.

use crate::error::{Error, Result};
use base64::Engine;

/// Decode the base64 payload of a data URL (strict alphabet, padded).
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>> {
    let mut parts = data_url.splitn(2, ',');
    let _prefix = parts.next();
    let payload = parts
        .next()
        .ok_or_else(|| Error::Validation("invalid data URL format".to_string()))?;

    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| Error::Validation(format!("invalid base64 payload: {}", e)))
}

/// Encode raw bytes as a JPEG data URL.
pub fn encode_data_url(data: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_identity() {
        let payload = vec![0xffu8, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46];
        let url = encode_data_url(&payload);
        let decoded = decode_data_url(&url).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_without_comma_rejected() {
        let err = decode_data_url("data:image/jpeg;base64").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_decode_bad_base64_rejected() {
        let err = decode_data_url("data:image/jpeg;base64,!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_decode_empty_payload() {
        let decoded = decode_data_url("data:image/jpeg;base64,").unwrap();
        assert!(decoded.is_empty());
    }
}
