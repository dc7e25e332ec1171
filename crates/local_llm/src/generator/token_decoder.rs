//! Implements [`TokenDecoder`], which reassembles UTF-8 text from token pieces.

/// Incrementally decodes the raw bytes of successive tokens into valid UTF-8 text.
///
/// Tokens do not necessarily end on a character boundary: a multi-byte character can be split
/// across two or more tokens. The decoder emits every complete character as soon as its last
/// byte arrives, keeps an incomplete trailing sequence pending, and replaces bytes that can never
/// form a character with [`char::REPLACEMENT_CHARACTER`].
#[derive(Clone, Debug, Default)]
pub struct TokenDecoder {
    pending: Vec<u8>,
}

impl TokenDecoder {
    /// Creates a decoder with nothing pending.
    pub fn new() -> TokenDecoder {
        TokenDecoder::default()
    }

    /// Appends the bytes of one token, returning the text that became decodable.
    ///
    /// The returned string is empty if the bytes only extend a pending character.
    pub fn add_token(&mut self, token: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(token);

        let mut out = String::new();
        let mut rest = buf.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // `valid_up_to` marks the end of the longest valid prefix
                    out.push_str(&String::from_utf8_lossy(valid));

                    if let Some(len) = err.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    } else {
                        self.pending.extend_from_slice(after);
                        break;
                    }
                }
            }
        }

        out
    }

    /// Whether an incomplete character is waiting for more bytes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drains the pending bytes, replacing them with [`char::REPLACEMENT_CHARACTER`]s.
    ///
    /// Returns `None` if nothing is pending.
    pub fn flush(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| {
            let out = String::from_utf8_lossy(&self.pending).to_string();
            self.pending.clear();
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut decoder = TokenDecoder::new();

        assert_eq!(decoder.add_token(b"Hello"), "Hello");
        assert_eq!(decoder.add_token(b", world"), ", world");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn split_code_point_is_emitted_once_complete() {
        let bytes = "é".as_bytes();
        let mut decoder = TokenDecoder::new();

        assert_eq!(decoder.add_token(&bytes[..1]), "");
        assert!(decoder.has_pending());
        assert_eq!(decoder.add_token(&bytes[1..]), "é");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn four_byte_code_point_over_three_tokens() {
        let bytes = "a🦀b".as_bytes();
        let mut decoder = TokenDecoder::new();

        let mut out = decoder.add_token(&bytes[..2]);
        assert_eq!(out, "a");
        out.push_str(&decoder.add_token(&bytes[2..4]));
        out.push_str(&decoder.add_token(&bytes[4..]));

        assert_eq!(out, "a🦀b");
    }

    #[test]
    fn valid_prefix_is_not_held_back() {
        let crab = "🦀".as_bytes();
        let mut token = b"ok ".to_vec();
        token.extend_from_slice(&crab[..1]);

        let mut decoder = TokenDecoder::new();

        assert_eq!(decoder.add_token(&token), "ok ");
        assert_eq!(decoder.add_token(&crab[1..]), "🦀");
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut decoder = TokenDecoder::new();

        assert_eq!(decoder.add_token(&[0xE3, 0x81]), "");
        assert_eq!(decoder.add_token(b"a"), "\u{FFFD}a");
        assert_eq!(decoder.add_token(&[0xFF, b'b']), "\u{FFFD}b");
    }

    #[test]
    fn flush_drains_incomplete_sequence() {
        let mut decoder = TokenDecoder::new();
        decoder.add_token(&"é".as_bytes()[..1]);

        assert_eq!(decoder.flush().as_deref(), Some("\u{FFFD}"));
        assert_eq!(decoder.flush(), None);
    }
}
