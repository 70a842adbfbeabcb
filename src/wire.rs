//! Release-message framing shared by both handlers.
//!
//! Messages cross process -- and potentially language-runtime -- boundaries,
//! so this is deliberately not a language-specific object serialization:
//! just a self-describing list of opaque UTF-8 strings (full names never
//! contain non-UTF-8 bytes, so JSON is sufficient and both handlers already
//! depend on `serde_json` for configuration).

use crate::error::{MutexError, MutexResult};

/// Encode the list of full names released in one operation.
pub fn encode_names(names: &[String]) -> Vec<u8> {
    serde_json::to_vec(names).expect("Vec<String> always serializes")
}

/// Decode a release message back into the list of full names.
pub fn decode_names(payload: &[u8]) -> MutexResult<Vec<String>> {
    serde_json::from_slice(payload)
        .map_err(|e| MutexError::Protocol(format!("malformed release message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let names = vec!["ns:a".to_string(), "ns:b".to_string()];
        let decoded = decode_names(&encode_names(&names)).unwrap();
        assert_eq!(decoded, names);
    }
}
