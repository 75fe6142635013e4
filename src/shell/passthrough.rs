//! Full-screen program hand-off
//!
//! While an editor, pager or monitor runs on the remote side every key goes
//! straight to the shell channel. [`ExitWatcher`] watches those raw bytes for
//! the program's quit command, and [`MarkerScanner`] watches remote output
//! for the terminal sequences that bracket full-screen mode and for the
//! prompt-ready marker the remote shell prints.

use super::input::partial_suffix_len;

/// Remote output events the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    AltScreenEnter,
    AltScreenExit,
    /// OSC 133;D, printed by the remote prompt when a command has finished.
    CommandDone,
}

/// Piece of scanned remote output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Bytes(Vec<u8>),
    Marker(Marker),
}

struct Pattern {
    bytes: &'static [u8],
    marker: Marker,
    /// Keep the sequence in the displayed output.
    visible: bool,
}

const PATTERNS: &[Pattern] = &[
    Pattern { bytes: b"\x1b[?1049h", marker: Marker::AltScreenEnter, visible: true },
    Pattern { bytes: b"\x1b[?1047h", marker: Marker::AltScreenEnter, visible: true },
    Pattern { bytes: b"\x1b[?47h", marker: Marker::AltScreenEnter, visible: true },
    Pattern { bytes: b"\x1b[?1049l", marker: Marker::AltScreenExit, visible: true },
    Pattern { bytes: b"\x1b[?1047l", marker: Marker::AltScreenExit, visible: true },
    Pattern { bytes: b"\x1b[?47l", marker: Marker::AltScreenExit, visible: true },
    Pattern { bytes: b"\x1b]133;D\x07", marker: Marker::CommandDone, visible: false },
    Pattern { bytes: b"\x1b]133;D\x1b\\", marker: Marker::CommandDone, visible: false },
];

/// Shell snippet that makes the remote prompt print the command-done marker.
pub const PROMPT_MARKER_SETUP: &str =
    "stty -echo 2>/dev/null; PS1=\"$(printf '\\033]133;D\\007')\"; PS2=''";

/// Splits remote output into plain bytes and markers. A marker split across
/// chunks is held back until the rest arrives.
#[derive(Debug, Default)]
pub struct MarkerScanner {
    held: Vec<u8>,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&mut self, chunk: &[u8]) -> Vec<Segment> {
        let mut data = std::mem::take(&mut self.held);
        data.extend_from_slice(chunk);

        let mut segments = Vec::new();
        let mut plain = Vec::new();
        let mut i = 0;
        'scan: while i < data.len() {
            if data[i] != 0x1b {
                plain.push(data[i]);
                i += 1;
                continue;
            }
            let rest = &data[i..];
            for pattern in PATTERNS {
                if rest.starts_with(pattern.bytes) {
                    // Entering full screen is reported before the sequence is
                    // shown, leaving it after.
                    let before = pattern.marker == Marker::AltScreenEnter;
                    if pattern.visible && !before {
                        plain.extend_from_slice(pattern.bytes);
                    }
                    if !plain.is_empty() {
                        segments.push(Segment::Bytes(std::mem::take(&mut plain)));
                    }
                    segments.push(Segment::Marker(pattern.marker));
                    if pattern.visible && before {
                        plain.extend_from_slice(pattern.bytes);
                    }
                    i += pattern.bytes.len();
                    continue 'scan;
                }
            }
            let may_continue = PATTERNS
                .iter()
                .any(|p| p.bytes.len() > rest.len() && p.bytes.starts_with(rest));
            if may_continue {
                self.held = rest.to_vec();
                break;
            }
            plain.push(0x1b);
            i += 1;
        }
        if !plain.is_empty() {
            segments.push(Segment::Bytes(plain));
        }
        segments
    }

    /// Releases held-back bytes, e.g. when the channel closes.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }
}

/// Kind of full-screen program, which decides its quit keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Vi,
    Nano,
    Pager,
    Monitor,
    /// Anything else, including programs detected only through the
    /// alternate screen. Quit is only recognised via Ctrl-C.
    Other,
}

impl ProgramKind {
    pub fn of(program: &str) -> Self {
        match program.rsplit('/').next().unwrap_or(program) {
            "vi" | "vim" | "nvim" | "view" | "vimdiff" => Self::Vi,
            "nano" | "pico" => Self::Nano,
            "less" | "more" | "most" | "man" => Self::Pager,
            "top" | "htop" | "btop" | "atop" => Self::Monitor,
            _ => Self::Other,
        }
    }
}

const RECENT_LIMIT: usize = 32;

const VI_QUIT_COMMANDS: &[&[u8]] = &[
    b":q", b":q!", b":wq", b":wq!", b":x", b":x!", b":qa", b":qa!", b":wqa", b":xa",
];

/// Recognises the quit command of a full-screen program from the raw keys
/// sent to it. Best effort: the program's own state is never known.
#[derive(Debug, Clone)]
pub struct ExitWatcher {
    kind: ProgramKind,
    recent: Vec<u8>,
}

impl ExitWatcher {
    pub fn new(program: &str) -> Self {
        Self {
            kind: ProgramKind::of(program),
            recent: Vec::new(),
        }
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    /// Feeds forwarded bytes; true once a quit sequence has been seen.
    pub fn observe(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            self.recent.push(byte);
            if self.recent.len() > RECENT_LIMIT {
                self.recent.remove(0);
            }
            if self.quit_seen() {
                self.recent.clear();
                return true;
            }
        }
        false
    }

    fn quit_seen(&self) -> bool {
        let recent = self.recent.as_slice();
        if recent.ends_with(&[0x03]) {
            return true;
        }
        match self.kind {
            ProgramKind::Vi => {
                VI_QUIT_COMMANDS
                    .iter()
                    .any(|cmd| ends_with_command(recent, cmd))
                    || recent.ends_with(b"ZZ")
                    || recent.ends_with(b"ZQ")
            }
            ProgramKind::Nano => recent.ends_with(&[0x18]),
            ProgramKind::Pager => recent.ends_with(b"q") || recent.ends_with(b"Q"),
            ProgramKind::Monitor => recent.ends_with(b"q") || recent.ends_with(b"\x1b[21~"),
            ProgramKind::Other => false,
        }
    }
}

/// `recent` ends with `command` followed by Enter.
fn ends_with_command(recent: &[u8], command: &[u8]) -> bool {
    match recent.split_last() {
        Some((b'\r' | b'\n', head)) => head.ends_with(command),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vim_quit_commands() {
        let mut watcher = ExitWatcher::new("vim");
        assert!(!watcher.observe(b"ihello\x1b"));
        assert!(watcher.observe(b":wq\n"));

        let mut watcher = ExitWatcher::new("/usr/bin/vi");
        assert_eq!(watcher.kind(), ProgramKind::Vi);
        assert!(!watcher.observe(b":q"));
        assert!(watcher.observe(b"!\r"));

        let mut watcher = ExitWatcher::new("vim");
        assert!(watcher.observe(b"ZZ"));
    }

    #[test]
    fn test_vim_ignores_plain_text() {
        let mut watcher = ExitWatcher::new("vim");
        assert!(!watcher.observe(b"iquit now\r:w\r"));
    }

    #[test]
    fn test_interrupt_always_exits() {
        for program in ["vim", "nano", "less", "top", "ncdu"] {
            let mut watcher = ExitWatcher::new(program);
            assert!(watcher.observe(b"\x03"), "{program}");
        }
    }

    #[test]
    fn test_pager_and_nano() {
        let mut watcher = ExitWatcher::new("less");
        assert!(!watcher.observe(b"  "));
        assert!(watcher.observe(b"q"));

        let mut watcher = ExitWatcher::new("nano");
        assert!(!watcher.observe(b"edit"));
        assert!(watcher.observe(&[0x18]));
    }

    #[test]
    fn test_scan_alt_screen_markers_kept_in_output() {
        let mut scanner = MarkerScanner::new();
        let segments = scanner.scan(b"a\x1b[?1049hb\x1b[?1049lc");
        assert_eq!(
            segments,
            vec![
                Segment::Bytes(b"a".to_vec()),
                Segment::Marker(Marker::AltScreenEnter),
                Segment::Bytes(b"\x1b[?1049hb\x1b[?1049l".to_vec()),
                Segment::Marker(Marker::AltScreenExit),
                Segment::Bytes(b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn test_scan_strips_command_done() {
        let mut scanner = MarkerScanner::new();
        let segments = scanner.scan(b"out\r\n\x1b]133;D\x07");
        assert_eq!(
            segments,
            vec![
                Segment::Bytes(b"out\r\n".to_vec()),
                Segment::Marker(Marker::CommandDone),
            ]
        );
    }

    #[test]
    fn test_scan_marker_split_across_chunks() {
        let mut scanner = MarkerScanner::new();
        assert_eq!(scanner.scan(b"x\x1b]13"), vec![Segment::Bytes(b"x".to_vec())]);
        assert_eq!(
            scanner.scan(b"3;D\x1b\\y"),
            vec![
                Segment::Marker(Marker::CommandDone),
                Segment::Bytes(b"y".to_vec()),
            ]
        );
    }

    #[test]
    fn test_scan_passes_other_escapes() {
        let mut scanner = MarkerScanner::new();
        assert_eq!(
            scanner.scan(b"\x1b[31mred\x1b[0m"),
            vec![Segment::Bytes(b"\x1b[31mred\x1b[0m".to_vec())]
        );
        assert!(scanner.flush().is_empty());
    }
}
