//! Utility functions for the gatt-session crate.

use std::fmt::Write as _;

/// Render bytes as space-separated upper-case hex.
///
/// # Example
///
/// ```
/// use gatt_session::hex_string;
///
/// assert_eq!(hex_string(&[0x01, 0xAB, 0xFF]), "01 AB FF");
/// assert_eq!(hex_string(&[]), "");
/// ```
pub fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Parse a hex string into bytes.
///
/// Whitespace, `:` and `-` separators are ignored, so `"01 ab"`, `"01:AB"`
/// and `"01ab"` are equivalent. Returns `None` on odd length or a non-hex
/// character.
///
/// # Example
///
/// ```
/// use gatt_session::parse_hex;
///
/// assert_eq!(parse_hex("01 AB:ff"), Some(vec![0x01, 0xAB, 0xFF]));
/// assert_eq!(parse_hex("0"), None);
/// ```
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':' && *b != b'-')
        .collect();

    if digits.len() % 2 != 0 {
        return None;
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
