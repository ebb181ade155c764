//! Reassembly of device output into lines.
//!
//! Notifications split device output at arbitrary points, even inside a
//! multi-byte character. [`TextDecoder`] holds an incomplete UTF-8 sequence
//! until the rest of it arrives, and [`LineReader`] keeps the unterminated
//! tail until its separator arrives.

/// Line separator printed by the device REPL.
pub const LINE_SEPARATOR: &str = "\r\n";

/// Line reader that handles partial text.
#[derive(Debug)]
pub struct LineReader {
    separator: String,
    pending: String,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new(LINE_SEPARATOR)
    }
}

impl LineReader {
    /// Creates a reader splitting on `separator`.
    ///
    /// An empty separator falls back to [`LINE_SEPARATOR`].
    #[must_use]
    pub fn new(separator: impl Into<String>) -> Self {
        let mut separator = separator.into();
        if separator.is_empty() {
            tracing::warn!("empty line separator, using {:?}", LINE_SEPARATOR);
            separator = LINE_SEPARATOR.to_owned();
        }
        Self {
            separator,
            pending: String::new(),
        }
    }

    /// The separator lines are split on.
    #[must_use]
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Feeds text and returns every line it completed, in order.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find(&self.separator) {
            let rest = self.pending.split_off(idx + self.separator.len());
            self.pending.truncate(idx);
            lines.push(std::mem::replace(&mut self.pending, rest));
        }
        lines
    }

    /// Returns the text received since the last separator.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Discards any unterminated text.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Incremental UTF-8 decoder for notification payloads.
///
/// Invalid bytes become U+FFFD. A sequence cut off at the end of a payload is
/// kept and completed by the next one.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `data` after any bytes held from the previous call.
    pub fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);

        let mut text = String::with_capacity(self.pending.len());
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                }
                Err(e) => {
                    let end = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..end]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = end + len;
                        }
                        None => {
                            start = end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        text
    }

    /// Bytes of an incomplete sequence waiting for the next payload.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drops any held bytes.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut reader = LineReader::default();
        assert_eq!(reader.feed("hello\r\n"), vec!["hello"]);
        assert_eq!(reader.pending(), "");
    }

    #[test]
    fn test_partial_line() {
        let mut reader = LineReader::default();
        assert!(reader.feed("hel").is_empty());
        assert!(reader.feed("lo\r").is_empty());
        assert_eq!(reader.feed("\nwor"), vec!["hello"]);
        assert_eq!(reader.pending(), "wor");
    }

    #[test]
    fn test_multiple_lines() {
        let mut reader = LineReader::default();
        assert_eq!(reader.feed("a\r\nb\r\n\r\nc"), vec!["a", "b", ""]);
        assert_eq!(reader.pending(), "c");
    }

    #[test]
    fn test_custom_separator() {
        let mut reader = LineReader::new("\n");
        assert_eq!(reader.feed("x\ny\n"), vec!["x", "y"]);
    }

    #[test]
    fn test_clear() {
        let mut reader = LineReader::default();
        reader.feed("stale");
        reader.clear();
        assert_eq!(reader.feed("fresh\r\n"), vec!["fresh"]);
    }

    #[test]
    fn test_empty_separator_falls_back() {
        let mut reader = LineReader::new("");
        assert_eq!(reader.separator(), LINE_SEPARATOR);
        assert!(reader.feed("abc").is_empty());
        assert_eq!(reader.feed("\r\n"), vec!["abc"]);
    }

    #[test]
    fn test_decoder_joins_split_code_point() {
        let mut decoder = TextDecoder::new();
        let bytes = "21°C".as_bytes();
        // ° is 0xC2 0xB0
        assert_eq!(decoder.decode(&bytes[..3]), "21");
        assert_eq!(decoder.pending(), &[0xc2]);
        assert_eq!(decoder.decode(&bytes[3..]), "°C");
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = TextDecoder::new();
        assert_eq!(decoder.decode(&[b'o', 0xff, b'k']), "o\u{fffd}k");
        // A lead byte followed by a non-continuation byte is invalid at once
        assert_eq!(decoder.decode(&[0xe2, b'x']), "\u{fffd}x");
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = TextDecoder::new();
        assert_eq!(decoder.decode(&[0xe2, 0x82]), "");
        decoder.clear();
        assert_eq!(decoder.decode(b"ok"), "ok");
    }
}
