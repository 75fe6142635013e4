//! Keyboard input decoding
//!
//! Raw terminal bytes arrive in arbitrary chunks: an escape sequence, a
//! UTF-8 character or a bracketed paste can be split across reads. The
//! decoder buffers bytes and hands out complete [`Key`]s one at a time, so
//! the caller can stop decoding mid-chunk (for example when a full-screen
//! program takes over) and get the remaining raw bytes back.

const BRACKETED_PASTE_START: &[u8] = b"\x1b[200~";
const BRACKETED_PASTE_END: &[u8] = b"\x1b[201~";

/// A decoded key press or paste.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Printable text, possibly several characters typed in one burst.
    Text(String),
    /// Bracketed paste payload with line breaks normalized to `\n`.
    Paste(String),
    Enter,
    Backspace,
    Delete,
    Tab,
    /// Ctrl-C
    Interrupt,
    /// Ctrl-L
    ClearScreen,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    Insert,
    PageUp,
    PageDown,
}

enum Escape {
    Key(Key),
    PasteStart,
    Skip,
    Incomplete,
}

enum TextRun {
    Text(String),
    Skipped,
    Incomplete,
}

#[derive(Debug, Default)]
pub struct KeyDecoder {
    pending: Vec<u8>,
    paste: Option<Vec<u8>>,
    after_cr: bool,
}

impl KeyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Drops everything buffered.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.paste = None;
        self.after_cr = false;
    }

    /// Returns buffered bytes that were not decoded yet, including an
    /// unfinished paste, and empties the decoder.
    pub fn drain_raw(&mut self) -> Vec<u8> {
        let mut raw = Vec::new();
        if let Some(paste) = self.paste.take() {
            raw.extend_from_slice(BRACKETED_PASTE_START);
            raw.extend(paste);
        }
        raw.append(&mut self.pending);
        self.after_cr = false;
        raw
    }

    /// Next complete key, or `None` when more bytes are needed.
    pub fn next_key(&mut self) -> Option<Key> {
        loop {
            if self.paste.is_some() {
                return self.continue_paste();
            }

            let first = *self.pending.first()?;
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match first {
                0x1b => match self.decode_escape() {
                    Escape::Key(key) => return Some(key),
                    Escape::PasteStart => {
                        self.paste = Some(Vec::new());
                    }
                    Escape::Skip => {}
                    Escape::Incomplete => return None,
                },
                b'\r' => {
                    self.pending.remove(0);
                    self.after_cr = true;
                    return Some(Key::Enter);
                }
                b'\n' => {
                    self.pending.remove(0);
                    if !after_cr {
                        return Some(Key::Enter);
                    }
                }
                0x7f | 0x08 => return Some(self.single(Key::Backspace)),
                b'\t' => return Some(self.single(Key::Tab)),
                0x03 => return Some(self.single(Key::Interrupt)),
                0x0c => return Some(self.single(Key::ClearScreen)),
                b if b < 0x20 => {
                    self.pending.remove(0);
                }
                _ => match self.decode_text() {
                    TextRun::Text(text) => return Some(Key::Text(text)),
                    TextRun::Skipped => {}
                    TextRun::Incomplete => return None,
                },
            }
        }
    }

    fn single(&mut self, key: Key) -> Key {
        self.pending.remove(0);
        key
    }

    fn continue_paste(&mut self) -> Option<Key> {
        let paste = self.paste.as_mut()?;
        match find(&self.pending, BRACKETED_PASTE_END) {
            Some(pos) => {
                paste.extend_from_slice(&self.pending[..pos]);
                self.pending.drain(..pos + BRACKETED_PASTE_END.len());
                let payload = self.paste.take().unwrap_or_default();
                Some(Key::Paste(normalize_line_breaks(&String::from_utf8_lossy(
                    &payload,
                ))))
            }
            None => {
                // Keep a possible partial end marker for the next chunk.
                let keep = partial_suffix_len(&self.pending, BRACKETED_PASTE_END);
                let take = self.pending.len() - keep;
                paste.extend(self.pending.drain(..take));
                None
            }
        }
    }

    fn decode_escape(&mut self) -> Escape {
        let len = self.pending.len();
        if len < 2 {
            return Escape::Incomplete;
        }
        match self.pending[1] {
            b'[' => {
                let mut end = 2;
                while end < len && (0x20..=0x3f).contains(&self.pending[end]) {
                    end += 1;
                }
                if end >= len {
                    return Escape::Incomplete;
                }
                let final_byte = self.pending[end];
                if !(0x40..=0x7e).contains(&final_byte) {
                    // Not a CSI sequence after all; drop the lone ESC.
                    self.pending.remove(0);
                    return Escape::Skip;
                }
                let params = String::from_utf8_lossy(&self.pending[2..end]).into_owned();
                self.pending.drain(..=end);
                csi_key(final_byte, &params)
            }
            b'O' => {
                if len < 3 {
                    return Escape::Incomplete;
                }
                let final_byte = self.pending[2];
                self.pending.drain(..3);
                csi_key(final_byte, "")
            }
            _ => {
                // Alt-modified key: forget the ESC, keep the key.
                self.pending.remove(0);
                Escape::Skip
            }
        }
    }

    /// Takes the longest run of printable UTF-8 text off the front.
    fn decode_text(&mut self) -> TextRun {
        let end = self
            .pending
            .iter()
            .position(|&b| b < 0x20 || b == 0x7f)
            .unwrap_or(self.pending.len());
        let run = &self.pending[..end];

        let valid = match std::str::from_utf8(run) {
            Ok(_) => end,
            Err(err) => {
                let valid = err.valid_up_to();
                let truncated = err.error_len().is_none() && end == self.pending.len();
                if valid == 0 {
                    if truncated {
                        return TextRun::Incomplete;
                    }
                    // Invalid byte, or a sequence cut off by a control byte.
                    let skip = err.error_len().unwrap_or(end).max(1);
                    self.pending.drain(..skip);
                    return TextRun::Skipped;
                }
                valid
            }
        };

        let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
        self.pending.drain(..valid);
        TextRun::Text(text)
    }
}

fn csi_key(final_byte: u8, params: &str) -> Escape {
    let key = match final_byte {
        b'A' => Key::Up,
        b'B' => Key::Down,
        b'C' => Key::Right,
        b'D' => Key::Left,
        b'H' => Key::Home,
        b'F' => Key::End,
        b'~' => match params.split(';').next().unwrap_or("") {
            "1" | "7" => Key::Home,
            "4" | "8" => Key::End,
            "2" => Key::Insert,
            "3" => Key::Delete,
            "5" => Key::PageUp,
            "6" => Key::PageDown,
            "200" => return Escape::PasteStart,
            _ => return Escape::Skip,
        },
        _ => return Escape::Skip,
    };
    Escape::Key(key)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest proper prefix of `marker` that `data` ends with.
pub(crate) fn partial_suffix_len(data: &[u8], marker: &[u8]) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| data.ends_with(&marker[..k]))
        .unwrap_or(0)
}

fn normalize_line_breaks(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut KeyDecoder) -> Vec<Key> {
        std::iter::from_fn(|| decoder.next_key()).collect()
    }

    fn decode(bytes: &[u8]) -> Vec<Key> {
        let mut decoder = KeyDecoder::new();
        decoder.push(bytes);
        decode_all(&mut decoder)
    }

    #[test]
    fn test_text_and_controls() {
        assert_eq!(
            decode(b"ls\r"),
            vec![Key::Text("ls".into()), Key::Enter]
        );
        assert_eq!(
            decode(b"\x7f\t\x03\x0c"),
            vec![Key::Backspace, Key::Tab, Key::Interrupt, Key::ClearScreen]
        );
    }

    #[test]
    fn test_crlf_is_one_enter() {
        assert_eq!(decode(b"\r\n"), vec![Key::Enter]);
        assert_eq!(decode(b"\n\n"), vec![Key::Enter, Key::Enter]);
    }

    #[test]
    fn test_arrow_and_editing_keys() {
        assert_eq!(
            decode(b"\x1b[A\x1b[B\x1b[C\x1b[D\x1bOH\x1b[F\x1b[3~\x1b[2~\x1b[1;5C"),
            vec![
                Key::Up,
                Key::Down,
                Key::Right,
                Key::Left,
                Key::Home,
                Key::End,
                Key::Delete,
                Key::Insert,
                Key::Right,
            ]
        );
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut decoder = KeyDecoder::new();
        decoder.push(b"\x1b");
        assert_eq!(decoder.next_key(), None);
        decoder.push(b"[");
        assert_eq!(decoder.next_key(), None);
        decoder.push(b"Dx");
        assert_eq!(decode_all(&mut decoder), vec![Key::Left, Key::Text("x".into())]);
    }

    #[test]
    fn test_alt_key_drops_escape() {
        assert_eq!(decode(b"\x1bb"), vec![Key::Text("b".into())]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "中".as_bytes();
        let mut decoder = KeyDecoder::new();
        decoder.push(&bytes[..1]);
        assert_eq!(decoder.next_key(), None);
        decoder.push(&bytes[1..]);
        assert_eq!(decoder.next_key(), Some(Key::Text("中".into())));
    }

    #[test]
    fn test_paste_across_chunks() {
        let mut decoder = KeyDecoder::new();
        decoder.push(b"\x1b[200~echo a\r\n");
        assert_eq!(decoder.next_key(), None);
        decoder.push(b"echo b\x1b[20");
        assert_eq!(decoder.next_key(), None);
        decoder.push(b"1~z");
        assert_eq!(
            decode_all(&mut decoder),
            vec![Key::Paste("echo a\necho b".into()), Key::Text("z".into())]
        );
    }

    #[test]
    fn test_drain_raw_returns_undecoded_bytes() {
        let mut decoder = KeyDecoder::new();
        decoder.push(b"a\r:wq\r");
        assert_eq!(decoder.next_key(), Some(Key::Text("a".into())));
        assert_eq!(decoder.next_key(), Some(Key::Enter));
        assert_eq!(decoder.drain_raw(), b":wq\r".to_vec());
        assert_eq!(decoder.next_key(), None);
    }

    #[test]
    fn test_invalid_utf8_is_skipped() {
        assert_eq!(decode(b"\xffab"), vec![Key::Text("ab".into())]);
    }

    #[test]
    fn test_partial_suffix_len() {
        assert_eq!(partial_suffix_len(b"abc\x1b[20", BRACKETED_PASTE_END), 4);
        assert_eq!(partial_suffix_len(b"abc", BRACKETED_PASTE_END), 0);
    }
}
