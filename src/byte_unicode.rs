//! Byte ↔ Unicode Mapping
//!
//! Byte-level BPE works on bytes, but the merge table and vocabulary are
//! stored as text. GPT-2 bridges the two by giving every byte value its own
//! printable character, so a UTF-8 byte string becomes a string of visible
//! characters that the merge table can refer to.
//!
//! ## The Table
//!
//! ```text
//! '!'..='~'   (0x21..=0x7e)  map to themselves
//! '¡'..='¬'   (0xa1..=0xac)  map to themselves
//! '®'..='ÿ'   (0xae..=0xff)  map to themselves
//! everything else            U+0100, U+0101, ... in ascending byte order
//! ```
//!
//! So the space byte `0x20` becomes `'Ġ'` (U+0120) and newline `0x0a` becomes
//! `'Ċ'` (U+010A), which is why GPT-2 vocabulary entries look like `"Ġthe"`.

use std::collections::HashMap;

/// Reversible map between the 256 byte values and printable characters
#[derive(Clone, Debug)]
pub struct ByteUnicodeMapping {
    encoder: [char; 256],
    decoder: HashMap<char, u8>,
}

impl ByteUnicodeMapping {
    /// Build the GPT-2 byte table
    pub fn new() -> Self {
        let printable = |b: u8| matches!(b, b'!'..=b'~' | 0xa1..=0xac | 0xae..=0xff);

        let mut encoder = ['\0'; 256];
        for byte in (0..=255u8).filter(|&b| printable(b)) {
            encoder[byte as usize] = char::from(byte);
        }
        let others = (0..=255u8).filter(|&b| !printable(b));
        for (byte, c) in others.zip('\u{100}'..) {
            encoder[byte as usize] = c;
        }

        let decoder = encoder
            .iter()
            .enumerate()
            .map(|(byte, &c)| (c, byte as u8))
            .collect();

        Self { encoder, decoder }
    }

    /// Character standing in for `byte`
    #[inline]
    pub fn encode_byte(&self, byte: u8) -> char {
        self.encoder[byte as usize]
    }

    /// Byte represented by `c`, if `c` is part of the table
    #[inline]
    pub fn decode_char(&self, c: char) -> Option<u8> {
        self.decoder.get(&c).copied()
    }

    /// Map a byte string to its token-string form
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::ByteUnicodeMapping;
    /// let map = ByteUnicodeMapping::new();
    /// assert_eq!(map.encode(b" the"), "Ġthe");
    /// ```
    pub fn encode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.encode_byte(b)).collect()
    }

    /// Map a token string back to bytes
    ///
    /// Characters that are not part of the table are skipped.
    pub fn decode(&self, text: &str) -> Vec<u8> {
        text.chars().filter_map(|c| self.decode_char(c)).collect()
    }
}

impl Default for ByteUnicodeMapping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_byte_roundtrips() {
        let map = ByteUnicodeMapping::new();
        for byte in 0..=255u8 {
            let c = map.encode_byte(byte);
            assert_eq!(map.decode_char(c), Some(byte), "byte {byte:#04x}");
        }
    }

    #[test]
    fn test_characters_are_distinct_and_printable() {
        let map = ByteUnicodeMapping::new();
        let chars: HashSet<char> = (0..=255u8).map(|b| map.encode_byte(b)).collect();
        assert_eq!(chars.len(), 256);
        assert!(chars.iter().all(|c| !c.is_control() && !c.is_whitespace()));
    }

    #[test]
    fn test_printable_bytes_map_to_themselves() {
        let map = ByteUnicodeMapping::new();
        assert_eq!(map.encode_byte(b'A'), 'A');
        assert_eq!(map.encode_byte(b'~'), '~');
        assert_eq!(map.encode_byte(0xe9), 'é');
    }

    #[test]
    fn test_remaining_bytes_start_at_256() {
        let map = ByteUnicodeMapping::new();
        assert_eq!(map.encode_byte(0x00), '\u{100}');
        assert_eq!(map.encode_byte(b' '), 'Ġ');
        assert_eq!(map.encode_byte(b'\n'), 'Ċ');
        // 0xad (soft hyphen) is the last byte assigned an extra code point
        assert_eq!(map.encode_byte(0xad), '\u{143}');
    }

    #[test]
    fn test_decode_skips_unknown_characters() {
        let map = ByteUnicodeMapping::new();
        assert_eq!(map.decode("hi\u{4e00}"), b"hi".to_vec());
    }
}
