//! Text and hex conversions used around the cipher engine

use crate::error::GattError;

/// UTF-8 encode `text`.
pub fn text_to_bytes(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// UTF-8 decode `bytes`. Zero padding left by CBC/ECB decrypts as NUL characters.
pub fn bytes_to_text(bytes: &[u8]) -> Result<String, GattError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Lowercase hex without separators.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse hex, ignoring whitespace and `:` separators (`"A7 D9 3B"`, `"a7:d9:3b"`).
pub fn hex_to_bytes(text: &str) -> Result<Vec<u8>, GattError> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    Ok(hex::decode(compact)?)
}
