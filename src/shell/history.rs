//! Command history
//!
//! In-memory navigation plus an append-only history file that survives
//! sessions. Entries are single lines; multi-line submissions are flattened
//! before they get here.

use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

pub const DEFAULT_MAX_ENTRIES: usize = 5000;

#[derive(Debug, Clone)]
pub struct History {
    entries: Vec<String>,
    position: Option<usize>,
    max_entries: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl History {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            position: None,
            max_entries: max_entries.max(1),
        }
    }

    /// Appends a submitted command. Empty commands and repeats of the last
    /// entry are skipped. Returns whether the entry was stored.
    pub fn record_submission(&mut self, entry: &str) -> bool {
        self.position = None;
        let entry = entry.trim();
        if entry.is_empty() || self.entries.last().map(String::as_str) == Some(entry) {
            return false;
        }
        self.entries.push(entry.to_string());
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
        true
    }

    /// One step back in time. Stays on the oldest entry once reached.
    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let pos = match self.position {
            None => self.entries.len() - 1,
            Some(pos) => pos.saturating_sub(1),
        };
        self.position = Some(pos);
        Some(&self.entries[pos])
    }

    /// One step forward. Moving past the newest entry yields an empty line
    /// and ends navigation; without navigation there is nothing to return.
    pub fn next(&mut self) -> Option<&str> {
        let pos = self.position?;
        if pos + 1 < self.entries.len() {
            self.position = Some(pos + 1);
            Some(&self.entries[pos + 1])
        } else {
            self.position = None;
            Some("")
        }
    }

    pub fn reset_navigation(&mut self) {
        self.position = None;
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn load(&mut self, mut entries: Vec<String>) {
        if entries.len() > self.max_entries {
            entries = entries.split_off(entries.len() - self.max_entries);
        }
        self.entries = entries;
        self.position = None;
    }
}

/// Append-only history file.
#[derive(Debug)]
pub struct HistoryFile {
    path: PathBuf,
    writer: Option<BufWriter<fs::File>>,
}

impl HistoryFile {
    /// Opens (creating if needed) the file at `path` and returns it with the
    /// entries it already holds, oldest first.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<String>)> {
        let entries = match fs::File::open(path) {
            Ok(file) => io::BufReader::new(file)
                .lines()
                .map_while(Result::ok)
                .map(|line| unescape_history_line(&line))
                .filter(|line| !line.trim().is_empty())
                .collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: Some(BufWriter::new(file)),
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one entry. A failing file is reported once and then ignored.
    pub fn append(&mut self, entry: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writeln!(writer, "{}", escape_history_line(entry)).and_then(|_| writer.flush());
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "history file disabled");
            self.writer = None;
        }
    }
}

fn escape_history_line(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_history_line(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
