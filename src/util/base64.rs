use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine as _;

use crate::error::{invalid_argument, FirestoreResult};

/// Encodes resume tokens, stream tokens and bytes values for storage and
/// the wire.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes [`encode`] output. Missing padding is tolerated.
pub fn decode(input: &str) -> FirestoreResult<Vec<u8>> {
    let mut normalized = input.to_string();
    let remainder = normalized.len() % 4;
    if remainder != 0 {
        normalized.extend("====".chars().take(4 - remainder));
    }
    STANDARD
        .decode(normalized.as_bytes())
        .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_decode_roundtrip() {
        let token = [0u8, 1, 2, 250, 255];
        assert_eq!(decode(&encode(&token)).unwrap(), token);
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn decode_tolerates_missing_padding() {
        let encoded = encode(b"data");
        let without_padding = encoded.trim_end_matches('=');
        assert_eq!(decode(without_padding).unwrap(), b"data");
    }

    #[test]
    fn decode_invalid_returns_error() {
        assert!(decode("@@invalid@@").is_err());
    }
}
