//! Edit buffer
//!
//! Holds the command being composed. A buffer starts as a single logical
//! line and is promoted to a multi-line buffer the first time a line is
//! split (continuation marker or multi-line paste). In multi-line form all
//! characters live in one backing vector and every line is a [`LineRecord`]
//! pointing into it; separators are implicit between records.
//!
//! Mutations return a [`Change`] describing what has to be redrawn, so the
//! buffer itself never touches the terminal.

use super::width::widths_of;

/// Which representation is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    SingleLine,
    MultiLine,
}

/// One logical line of a multi-line buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    /// Index of the first character in the backing text.
    pub start_offset: usize,
    /// Number of characters in the line.
    pub length: usize,
    /// Display width of each character, `widths.len() == length`.
    pub widths: Vec<usize>,
    /// The line was ended with a continuation marker rather than a literal
    /// line break.
    pub continued: bool,
}

impl LineRecord {
    pub fn display_width(&self) -> usize {
        self.widths.iter().sum()
    }
}

/// What a mutation did to the visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Line the edit started on.
    pub line: usize,
    /// First column whose content changed.
    pub column: usize,
    /// Widths of the characters from `column` to the end of `line`, after the edit.
    pub suffix_widths: Vec<usize>,
    /// Change in the display width of `line`.
    pub width_delta: isize,
    /// Lines after `line` were added, removed or shifted and must be redrawn too.
    pub reflow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    Single { text: Vec<char>, widths: Vec<usize> },
    Multi { text: Vec<char>, lines: Vec<LineRecord> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditBuffer {
    repr: Repr,
}

impl Default for EditBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EditBuffer {
    pub fn new() -> Self {
        Self {
            repr: Repr::Single {
                text: Vec::new(),
                widths: Vec::new(),
            },
        }
    }

    /// Single-line buffer holding `text`.
    pub fn from_text(text: &str) -> Self {
        let text: Vec<char> = text.chars().collect();
        let widths = widths_of(&text);
        Self {
            repr: Repr::Single { text, widths },
        }
    }

    pub fn mode(&self) -> BufferMode {
        match self.repr {
            Repr::Single { .. } => BufferMode::SingleLine,
            Repr::Multi { .. } => BufferMode::MultiLine,
        }
    }

    pub fn total_lines(&self) -> usize {
        match &self.repr {
            Repr::Single { .. } => 1,
            Repr::Multi { lines, .. } => lines.len(),
        }
    }

    pub fn line_length(&self, line: usize) -> usize {
        self.line_chars(line).len()
    }

    pub fn line_chars(&self, line: usize) -> &[char] {
        self.check_line(line);
        match &self.repr {
            Repr::Single { text, .. } => text,
            Repr::Multi { text, lines } => {
                let record = &lines[line];
                &text[record.start_offset..record.start_offset + record.length]
            }
        }
    }

    pub fn line_widths(&self, line: usize) -> &[usize] {
        self.check_line(line);
        match &self.repr {
            Repr::Single { widths, .. } => widths,
            Repr::Multi { lines, .. } => &lines[line].widths,
        }
    }

    pub fn line_text(&self, line: usize) -> String {
        self.line_chars(line).iter().collect()
    }

    /// Line records of a multi-line buffer.
    #[cfg(test)]
    pub fn line_records(&self) -> Option<&[LineRecord]> {
        match &self.repr {
            Repr::Single { .. } => None,
            Repr::Multi { lines, .. } => Some(lines),
        }
    }

    /// Concatenated backing text of a multi-line buffer.
    #[cfg(test)]
    pub fn backing_text(&self) -> &[char] {
        match &self.repr {
            Repr::Single { text, .. } => text,
            Repr::Multi { text, .. } => text,
        }
    }

    /// Display width of the first `column` characters of `line`.
    pub fn width_before(&self, line: usize, column: usize) -> usize {
        self.check_position(line, column);
        self.line_widths(line)[..column].iter().sum()
    }

    pub fn is_continued(&self, line: usize) -> bool {
        self.check_line(line);
        match &self.repr {
            Repr::Single { .. } => false,
            Repr::Multi { lines, .. } => lines[line].continued,
        }
    }

    pub fn set_continued(&mut self, line: usize, continued: bool) {
        self.check_line(line);
        if let Repr::Multi { lines, .. } = &mut self.repr {
            lines[line].continued = continued;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_lines() == 1 && self.line_length(0) == 0
    }

    /// All lines joined with `\n`.
    pub fn text(&self) -> String {
        (0..self.total_lines())
            .map(|line| self.line_text(line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text as the remote shell must receive it: continued lines keep a
    /// trailing backslash before the line break. Trailing blank lines are
    /// dropped so a dangling continuation does not leave the shell waiting.
    pub fn wire_text(&self) -> String {
        let mut last = self.total_lines() - 1;
        while last > 0 && self.line_text(last).trim().is_empty() {
            last -= 1;
        }
        let mut out = String::new();
        for line in 0..=last {
            out.push_str(&self.line_text(line));
            if line < last {
                if self.is_continued(line) {
                    out.push_str("\\\n");
                } else {
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Single-line rendition for history: continued lines are concatenated,
    /// separate lines become `; `-separated commands.
    pub fn history_text(&self) -> String {
        let mut commands = Vec::new();
        let mut current = String::new();
        for line in 0..self.total_lines() {
            current.push_str(&self.line_text(line));
            if self.is_continued(line) {
                continue;
            }
            let command = current.trim();
            if !command.is_empty() {
                commands.push(command.to_string());
            }
            current.clear();
        }
        let command = current.trim();
        if !command.is_empty() {
            commands.push(command.to_string());
        }
        commands.join("; ")
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Replaces everything with a single line of `text`.
    pub fn replace_all(&mut self, text: &str) -> Change {
        let reflow = self.mode() == BufferMode::MultiLine;
        let old_width: usize = self.line_widths(0).iter().sum();
        *self = Self::from_text(text);
        let suffix_widths = self.line_widths(0).to_vec();
        let new_width: usize = suffix_widths.iter().sum();
        Change {
            line: 0,
            column: 0,
            suffix_widths,
            width_delta: new_width as isize - old_width as isize,
            reflow,
        }
    }

    /// Inserts `text` (no line breaks) at `column` of `line`.
    pub fn insert_at(&mut self, line: usize, column: usize, text: &str) -> Change {
        self.check_position(line, column);
        debug_assert!(!text.contains('\n'), "line breaks go through split_at");

        let chars: Vec<char> = text.chars().collect();
        let count = chars.len();
        let new_widths = widths_of(&chars);
        let added: usize = new_widths.iter().sum();

        match &mut self.repr {
            Repr::Single { text, widths } => {
                text.splice(column..column, chars);
                widths.splice(column..column, new_widths);
            }
            Repr::Multi { text, lines } => {
                let record = &mut lines[line];
                let at = record.start_offset + column;
                text.splice(at..at, chars);
                record.length += count;
                record.widths.splice(column..column, new_widths);
                for later in &mut lines[line + 1..] {
                    later.start_offset += count;
                }
            }
        }

        Change {
            line,
            column,
            suffix_widths: self.line_widths(line)[column..].to_vec(),
            width_delta: added as isize,
            reflow: false,
        }
    }

    /// Removes `count` characters starting at `column` of `line`.
    pub fn delete_at(&mut self, line: usize, column: usize, count: usize) -> Change {
        self.check_position(line, column);
        assert!(
            column + count <= self.line_length(line),
            "delete of {count} chars at {line}:{column} runs past the end of the line"
        );

        let removed: usize = self.line_widths(line)[column..column + count].iter().sum();

        match &mut self.repr {
            Repr::Single { text, widths } => {
                text.drain(column..column + count);
                widths.drain(column..column + count);
            }
            Repr::Multi { text, lines } => {
                let record = &mut lines[line];
                let at = record.start_offset + column;
                text.drain(at..at + count);
                record.length -= count;
                record.widths.drain(column..column + count);
                for later in &mut lines[line + 1..] {
                    later.start_offset -= count;
                }
            }
        }

        Change {
            line,
            column,
            suffix_widths: self.line_widths(line)[column..].to_vec(),
            width_delta: -(removed as isize),
            reflow: false,
        }
    }

    /// Divides `line` in two at `column`. The new boundary is a plain line
    /// break; the second half inherits the original line's continuation flag.
    pub fn split_at(&mut self, line: usize, column: usize) -> Change {
        self.check_position(line, column);
        self.promote();

        let Repr::Multi { lines, .. } = &mut self.repr else {
            unreachable!("promote always yields a multi-line buffer")
        };
        let record = &mut lines[line];
        let tail_widths = record.widths.split_off(column);
        let tail_width: usize = tail_widths.iter().sum();
        let tail = LineRecord {
            start_offset: record.start_offset + column,
            length: record.length - column,
            widths: tail_widths,
            continued: std::mem::replace(&mut record.continued, false),
        };
        record.length = column;
        lines.insert(line + 1, tail);

        Change {
            line,
            column,
            suffix_widths: Vec::new(),
            width_delta: -(tail_width as isize),
            reflow: true,
        }
    }

    /// Appends line `line + 1` to `line`, removing the boundary between them.
    pub fn join_with_next(&mut self, line: usize) -> Change {
        assert!(
            line + 1 < self.total_lines(),
            "line {line} has no following line to join"
        );
        let Repr::Multi { lines, .. } = &mut self.repr else {
            unreachable!("a single-line buffer has no line boundary")
        };

        let next = lines.remove(line + 1);
        let record = &mut lines[line];
        let column = record.length;
        let added = next.display_width();
        record.length += next.length;
        record.widths.extend(next.widths);
        record.continued = next.continued;

        Change {
            line,
            column,
            suffix_widths: record.widths[column..].to_vec(),
            width_delta: added as isize,
            reflow: true,
        }
    }

    fn promote(&mut self) {
        let repr = std::mem::replace(
            &mut self.repr,
            Repr::Multi {
                text: Vec::new(),
                lines: Vec::new(),
            },
        );
        self.repr = match repr {
            Repr::Single { text, widths } => {
                let length = text.len();
                Repr::Multi {
                    text,
                    lines: vec![LineRecord {
                        start_offset: 0,
                        length,
                        widths,
                        continued: false,
                    }],
                }
            }
            multi => multi,
        };
    }

    fn check_line(&self, line: usize) {
        assert!(
            line < self.total_lines(),
            "line {line} out of range ({} lines)",
            self.total_lines()
        );
    }

    fn check_position(&self, line: usize, column: usize) {
        let length = self.line_length(line);
        assert!(
            column <= length,
            "column {column} out of range for line {line} ({length} chars)"
        );
    }
}
