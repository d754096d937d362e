//! Base64 helpers for binary marshalling and the `atob`/`btoa` globals.
//!
//! Encoding is standard padded base64. Decoding is forgiving the way `atob`
//! is: ASCII whitespace is ignored and padding is optional.

use base64::{engine::general_purpose, Engine as _};

/// Encode bytes to base64.
pub fn encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Decode base64 to bytes.
pub fn decode(input: &str) -> Result<Vec<u8>, String> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    general_purpose::STANDARD_NO_PAD
        .decode(compact.trim_end_matches('='))
        .map_err(|e| format!("invalid base64: {e}"))
}
