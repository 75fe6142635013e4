//! Cursor tracking and incremental screen updates
//!
//! The terminal cursor is only ever moved with relative motion sequences.
//! [`CursorTracker`] remembers where the terminal cursor is, measured in
//! rows below the prompt line and screen columns, so every move can be
//! computed as a delta against the current buffer layout. [`Renderer`]
//! turns buffer [`Change`]s into the minimal redraw and collects the bytes
//! for the caller to write out.
//!
//! When the terminal width is known, buffer lines longer than the terminal
//! are laid out over several rows the way the terminal wraps them. Without
//! it every buffer line is a single row.

use crossterm::cursor::{MoveDown, MoveLeft, MoveRight, MoveUp, SetCursorStyle};
use crossterm::terminal::{Clear, ClearType};
use crossterm::Command;

use super::buffer::{Change, EditBuffer};

/// Prompt shown in front of every continuation line.
pub const CONTINUATION_PROMPT: &str = "> ";
pub const CONTINUATION_WIDTH: usize = 2;

/// Logical cursor position inside the edit buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub line: usize,
    pub column: usize,
    /// Insert (true) or overwrite mode. Only changes the cursor shape.
    pub insert_mode: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            line: 0,
            column: 0,
            insert_mode: true,
        }
    }
}

impl CursorState {
    pub fn position(&self) -> (usize, usize) {
        (self.line, self.column)
    }
}

/// Screen column of a logical position.
pub fn screen_column(buffer: &EditBuffer, prompt_width: usize, line: usize, column: usize) -> usize {
    let lead = if line == 0 {
        prompt_width
    } else {
        CONTINUATION_WIDTH
    };
    lead + buffer.width_before(line, column)
}

/// Position one character to the left, crossing to the end of the previous
/// line at column 0.
pub fn step_left(buffer: &EditBuffer, line: usize, column: usize) -> Option<(usize, usize)> {
    if column > 0 {
        Some((line, column - 1))
    } else if line > 0 {
        Some((line - 1, buffer.line_length(line - 1)))
    } else {
        None
    }
}

/// Position one character to the right, crossing to the start of the next
/// line at the end of a line.
pub fn step_right(buffer: &EditBuffer, line: usize, column: usize) -> Option<(usize, usize)> {
    if column < buffer.line_length(line) {
        Some((line, column + 1))
    } else if line + 1 < buffer.total_lines() {
        Some((line + 1, 0))
    } else {
        None
    }
}

/// Appends the relative motion from one screen cell to another.
/// Zero-distance axes produce nothing.
pub fn relative_motion(out: &mut String, from: (usize, usize), to: (usize, usize)) {
    let (from_row, from_col) = from;
    let (to_row, to_col) = to;

    if to_row < from_row {
        emit(out, MoveUp(clamp_u16(from_row - to_row)));
    } else if to_row > from_row {
        emit(out, MoveDown(clamp_u16(to_row - from_row)));
    }

    if to_col < from_col {
        emit(out, MoveLeft(clamp_u16(from_col - to_col)));
    } else if to_col > from_col {
        emit(out, MoveRight(clamp_u16(to_col - from_col)));
    }
}

fn emit(out: &mut String, command: impl Command) {
    // Writing into a String cannot fail.
    let _ = command.write_ansi(out);
}

fn clamp_u16(value: usize) -> u16 {
    value.min(u16::MAX as usize) as u16
}

/// Where the terminal cursor currently is, relative to the origin of the
/// prompt line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CursorTracker {
    row: usize,
    col: usize,
    /// Terminal width, when known.
    columns: Option<usize>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_columns(columns: usize) -> Self {
        let mut tracker = Self::new();
        tracker.set_columns(Some(columns));
        tracker
    }

    pub fn set_columns(&mut self, columns: Option<usize>) {
        self.columns = columns.filter(|&c| c > 0);
    }

    /// Terminal cell of a logical position, as `(row, column)` from the
    /// origin of the prompt line.
    pub fn cell(&self, buffer: &EditBuffer, prompt_width: usize, line: usize, column: usize) -> (usize, usize) {
        let x = screen_column(buffer, prompt_width, line, column);
        let Some(width) = self.columns else {
            return (line, x);
        };
        let above: usize = (0..line)
            .map(|l| rows_of(buffer, prompt_width, l, width))
            .sum();
        (above + x / width, x % width)
    }

    /// True when text ending at `x` leaves the terminal cursor parked in
    /// the last column, waiting for the next character to wrap it.
    fn wrap_pending(&self, x: usize) -> bool {
        self.columns.is_some_and(|width| x > 0 && x % width == 0)
    }

    #[cfg(test)]
    pub fn screen_position(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    /// Records that the terminal cursor is at `(row, col)` without moving it.
    pub fn set(&mut self, row: usize, col: usize) {
        self.row = row;
        self.col = col;
    }

    /// Appends the motion to the logical position and records it.
    pub fn move_to(
        &mut self,
        out: &mut String,
        buffer: &EditBuffer,
        prompt_width: usize,
        line: usize,
        column: usize,
    ) {
        let target = self.cell(buffer, prompt_width, line, column);
        relative_motion(out, (self.row, self.col), target);
        self.set(target.0, target.1);
    }
}

/// Screen rows a buffer line takes at terminal width `width`. A line that
/// exactly fills its last row gets an extra one for the cursor.
fn rows_of(buffer: &EditBuffer, prompt_width: usize, line: usize, width: usize) -> usize {
    screen_column(buffer, prompt_width, line, buffer.line_length(line)) / width + 1
}

/// Accumulates the bytes of screen updates.
#[derive(Debug, Default)]
pub struct Renderer {
    tracker: CursorTracker,
    out: Vec<u8>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &CursorTracker {
        &self.tracker
    }

    /// Forgets the tracked position; the next draw starts at the origin.
    pub fn reset(&mut self) {
        self.tracker.set(0, 0);
    }

    /// Terminal width used to lay out long lines; `None` when unknown.
    pub fn set_columns(&mut self, columns: Option<usize>) {
        self.tracker.set_columns(columns);
    }

    /// Records that text was written up to the end of `line`.
    fn settle_at_end(&mut self, buffer: &EditBuffer, prompt_width: usize, line: usize) {
        let end = buffer.line_length(line);
        self.force_wrap(screen_column(buffer, prompt_width, line, end));
        let (row, col) = self.tracker.cell(buffer, prompt_width, line, end);
        self.tracker.set(row, col);
    }

    /// Moves a cursor parked in the last column onto the next row. The
    /// space lands on a row that belongs to the same buffer line.
    fn force_wrap(&mut self, x: usize) {
        if self.tracker.wrap_pending(x) {
            self.write(" \r");
        }
    }

    /// Takes the collected output.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Appends text that the tracker does not follow.
    pub fn write(&mut self, text: &str) {
        self.out.extend_from_slice(text.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn command(&mut self, command: impl Command) {
        let mut seq = String::new();
        emit(&mut seq, command);
        self.write(&seq);
    }

    pub fn move_to(&mut self, buffer: &EditBuffer, prompt_width: usize, line: usize, column: usize) {
        let mut seq = String::new();
        self.tracker
            .move_to(&mut seq, buffer, prompt_width, line, column);
        self.write(&seq);
    }

    /// Draws `prompt` and the whole buffer starting at the current terminal
    /// position, which must be the start of an empty row.
    pub fn draw(
        &mut self,
        prompt: &str,
        prompt_width: usize,
        buffer: &EditBuffer,
        cursor: (usize, usize),
    ) {
        self.write(prompt);
        self.force_wrap(prompt_width);
        let (row, col) = self.tracker.cell(buffer, prompt_width, 0, 0);
        self.tracker.set(row, col);
        self.redraw_from(buffer, prompt_width, 0, 0, cursor);
    }

    /// Redraws whatever `change` touched, then parks the cursor at `cursor`.
    pub fn apply(
        &mut self,
        change: &Change,
        buffer: &EditBuffer,
        prompt_width: usize,
        cursor: (usize, usize),
    ) {
        let start = screen_column(buffer, prompt_width, change.line, change.column);
        let end_x = start + change.suffix_widths.iter().sum::<usize>();
        if change.reflow || self.rows_changed(end_x, change.width_delta) {
            self.redraw_from(buffer, prompt_width, change.line, change.column, cursor);
            return;
        }

        self.move_to(buffer, prompt_width, change.line, change.column);
        let suffix: String = buffer.line_chars(change.line)[change.column..]
            .iter()
            .collect();
        self.write(&suffix);
        self.force_wrap(end_x);
        if change.width_delta < 0 {
            self.command(Clear(ClearType::UntilNewLine));
        }
        let end = buffer.line_length(change.line);
        let (row, col) = self.tracker.cell(buffer, prompt_width, change.line, end);
        self.tracker.set(row, col);
        self.move_to(buffer, prompt_width, cursor.0, cursor.1);
    }

    /// Whether a line now ending at `end_x` takes a different number of rows
    /// than before, so everything below it moves.
    fn rows_changed(&self, end_x: usize, width_delta: isize) -> bool {
        let Some(width) = self.tracker.columns else {
            return false;
        };
        let before = end_x as isize - width_delta;
        before < 0 || before as usize / width != end_x / width
    }

    /// Rewrites one line from `column` to its end, clearing leftovers.
    pub fn redraw_line(
        &mut self,
        buffer: &EditBuffer,
        prompt_width: usize,
        line: usize,
        column: usize,
        cursor: (usize, usize),
    ) {
        self.move_to(buffer, prompt_width, line, column);
        let suffix: String = buffer.line_chars(line)[column..].iter().collect();
        self.write(&suffix);
        self.settle_at_end(buffer, prompt_width, line);
        self.command(Clear(ClearType::UntilNewLine));
        self.move_to(buffer, prompt_width, cursor.0, cursor.1);
    }

    /// Redraws from `(line, column)` through the last line and clears
    /// anything left below.
    pub fn redraw_from(
        &mut self,
        buffer: &EditBuffer,
        prompt_width: usize,
        line: usize,
        column: usize,
        cursor: (usize, usize),
    ) {
        self.move_to(buffer, prompt_width, line, column);
        let rest: String = buffer.line_chars(line)[column..].iter().collect();
        self.write(&rest);
        self.settle_at_end(buffer, prompt_width, line);
        self.command(Clear(ClearType::UntilNewLine));
        for later in line + 1..buffer.total_lines() {
            self.write("\r\n");
            self.write(CONTINUATION_PROMPT);
            self.write(&buffer.line_text(later));
            self.settle_at_end(buffer, prompt_width, later);
            self.command(Clear(ClearType::UntilNewLine));
        }
        self.command(Clear(ClearType::FromCursorDown));
        self.move_to(buffer, prompt_width, cursor.0, cursor.1);
    }

    /// Moves below the last buffer line so output can follow. The tracker
    /// restarts at the origin of the next prompt.
    pub fn leave(&mut self, buffer: &EditBuffer, prompt_width: usize) {
        let last = buffer.total_lines() - 1;
        self.move_to(buffer, prompt_width, last, buffer.line_length(last));
        self.write("\r\n");
        self.reset();
    }

    /// Removes the prompt and buffer from the screen, leaving the cursor
    /// where the prompt started. `prompt_rows` of 0 means no prompt is shown
    /// and only the buffer is cleared.
    pub fn erase(&mut self, buffer: &EditBuffer, prompt_width: usize, prompt_rows: usize) {
        self.move_to(buffer, prompt_width, 0, 0);
        if prompt_rows > 0 {
            self.write("\r");
            if prompt_rows > 1 {
                self.command(MoveUp(clamp_u16(prompt_rows - 1)));
            }
        }
        self.command(Clear(ClearType::FromCursorDown));
        self.reset();
    }

    /// Moves up one row and clears it along with everything below.
    pub fn clear_previous_row(&mut self) {
        self.command(MoveUp(1));
        self.write("\r");
        self.command(Clear(ClearType::FromCursorDown));
    }

    pub fn clear_screen(&mut self) {
        self.command(Clear(ClearType::All));
        self.command(crossterm::cursor::MoveTo(0, 0));
        self.reset();
    }

    pub fn cursor_style(&mut self, insert_mode: bool) {
        if insert_mode {
            self.command(SetCursorStyle::BlinkingBar);
        } else {
            self.command(SetCursorStyle::SteadyBlock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Applies the relative motions in `seq` to `start`, ignoring everything
    /// that is not a cursor motion. Columns are clamped at 0 like a terminal.
    fn simulate(start: (i64, i64), seq: &str) -> (i64, i64) {
        let (mut row, mut col) = start;
        let bytes = seq.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'[') {
                let mut j = i + 2;
                while j < bytes.len() && !(0x40..=0x7e).contains(&bytes[j]) {
                    j += 1;
                }
                let n: i64 = std::str::from_utf8(&bytes[i + 2..j])
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(1);
                match bytes.get(j) {
                    Some(b'A') => row -= n,
                    Some(b'B') => row += n,
                    Some(b'C') => col += n,
                    Some(b'D') => col = (col - n).max(0),
                    _ => {}
                }
                i = j + 1;
            } else {
                if bytes[i] == b'\r' {
                    col = 0;
                }
                i += 1;
            }
        }
        (row, col)
    }

    fn sample_buffer() -> EditBuffer {
        let mut buffer = EditBuffer::from_text("ls 中文");
        buffer.split_at(0, 2);
        buffer.insert_at(1, 0, "-la");
        buffer.split_at(1, 4);
        buffer
    }

    #[test]
    fn test_zero_distance_emits_nothing() {
        let mut out = String::new();
        relative_motion(&mut out, (1, 5), (1, 5));
        assert!(out.is_empty());
    }

    #[test]
    fn test_relative_motion_sequences() {
        let mut out = String::new();
        relative_motion(&mut out, (2, 10), (0, 4));
        assert_eq!(out, "\x1b[2A\x1b[6D");
        let mut out = String::new();
        relative_motion(&mut out, (0, 0), (1, 3));
        assert_eq!(out, "\x1b[1B\x1b[3C");
    }

    #[test]
    fn test_move_counts_wide_characters() {
        let buffer = EditBuffer::from_text("a中b");
        let mut tracker = CursorTracker::new();
        tracker.set(0, 2 + 4);
        let mut out = String::new();
        tracker.move_to(&mut out, &buffer, 2, 0, 1);
        assert_eq!(out, "\x1b[3D");
        assert_eq!(tracker.screen_position(), (0, 3));
    }

    #[test]
    fn test_moves_compose() {
        let buffer = sample_buffer();
        let prompt_width = 7;
        let mut positions = Vec::new();
        for line in 0..buffer.total_lines() {
            for column in 0..=buffer.line_length(line) {
                positions.push((line, column));
            }
        }

        for &a in &positions {
            for &b in &positions {
                for &c in positions.iter().step_by(3) {
                    let mut tracker = CursorTracker::new();
                    tracker.set(a.0, screen_column(&buffer, prompt_width, a.0, a.1));
                    let start = tracker.screen_position();
                    let start = (start.0 as i64, start.1 as i64);

                    let mut via = String::new();
                    tracker.move_to(&mut via, &buffer, prompt_width, b.0, b.1);
                    tracker.move_to(&mut via, &buffer, prompt_width, c.0, c.1);

                    let mut direct_tracker = CursorTracker::new();
                    direct_tracker.set(a.0, screen_column(&buffer, prompt_width, a.0, a.1));
                    let mut direct = String::new();
                    direct_tracker.move_to(&mut direct, &buffer, prompt_width, c.0, c.1);

                    let expected = (
                        c.0 as i64,
                        screen_column(&buffer, prompt_width, c.0, c.1) as i64,
                    );
                    assert_eq!(simulate(start, &via), expected);
                    assert_eq!(simulate(start, &direct), expected);
                }
            }
        }
    }

    #[test]
    fn test_wrapped_cells() {
        let buffer = EditBuffer::from_text("abcdefghijkl");
        let tracker = CursorTracker::with_columns(10);
        assert_eq!(tracker.cell(&buffer, 2, 0, 7), (0, 9));
        assert_eq!(tracker.cell(&buffer, 2, 0, 8), (1, 0));
        assert_eq!(tracker.cell(&buffer, 2, 0, 12), (1, 4));

        // later lines start below every row of the wrapped one
        let mut buffer = buffer;
        buffer.split_at(0, 12);
        assert_eq!(tracker.cell(&buffer, 2, 1, 0), (2, 2));
    }

    #[test]
    fn test_moves_compose_when_wrapped() {
        let buffer = sample_buffer();
        let prompt_width = 7;
        let mut positions = Vec::new();
        for line in 0..buffer.total_lines() {
            for column in 0..=buffer.line_length(line) {
                positions.push((line, column));
            }
        }

        for &a in &positions {
            for &b in &positions {
                let mut tracker = CursorTracker::with_columns(4);
                let (row, col) = tracker.cell(&buffer, prompt_width, a.0, a.1);
                tracker.set(row, col);

                let mut out = String::new();
                tracker.move_to(&mut out, &buffer, prompt_width, b.0, b.1);
                let (row_b, col_b) = tracker.cell(&buffer, prompt_width, b.0, b.1);
                assert!(col_b < 4);
                assert_eq!(
                    simulate((row as i64, col as i64), &out),
                    (row_b as i64, col_b as i64)
                );
            }
        }
    }

    #[test]
    fn test_draw_forces_wrap_at_margin() {
        let buffer = EditBuffer::from_text("abcdefgh");
        let mut renderer = Renderer::new();
        renderer.set_columns(Some(10));
        renderer.draw("$ ", 2, &buffer, (0, 8));
        let out = String::from_utf8(renderer.take()).unwrap();
        assert_eq!(out, "$ abcdefgh \r\x1b[K\x1b[J");
        assert_eq!(renderer.tracker().screen_position(), (1, 0));
    }

    #[test]
    fn test_insert_that_adds_a_row_redraws_below() {
        let mut buffer = EditBuffer::from_text("abcdefg");
        let mut renderer = Renderer::new();
        renderer.set_columns(Some(10));
        renderer.draw("$ ", 2, &buffer, (0, 7));
        renderer.take();

        let change = buffer.insert_at(0, 7, "h");
        renderer.apply(&change, &buffer, 2, (0, 8));
        let out = String::from_utf8(renderer.take()).unwrap();
        assert_eq!(out, "h \r\x1b[K\x1b[J");
        assert_eq!(renderer.tracker().screen_position(), (1, 0));

        renderer.move_to(&buffer, 2, 0, 0);
        let out = String::from_utf8(renderer.take()).unwrap();
        assert_eq!(simulate((1, 0), &out), (0, 2));
    }

    #[test]
    fn test_reset_keeps_terminal_width() {
        let buffer = EditBuffer::from_text("abcdefghij");
        let mut renderer = Renderer::new();
        renderer.set_columns(Some(10));
        renderer.reset();
        renderer.draw("$ ", 2, &buffer, (0, 10));
        assert_eq!(renderer.tracker().screen_position(), (1, 2));
    }

    #[test]
    fn test_step_crosses_lines() {
        let buffer = sample_buffer();
        assert_eq!(step_left(&buffer, 1, 0), Some((0, 2)));
        assert_eq!(step_right(&buffer, 0, 2), Some((1, 0)));
        assert_eq!(step_left(&buffer, 0, 0), None);
        let last = buffer.total_lines() - 1;
        assert_eq!(step_right(&buffer, last, buffer.line_length(last)), None);
    }

    #[test]
    fn test_apply_insert_redraws_suffix_only() {
        let mut buffer = EditBuffer::from_text("ac");
        let mut renderer = Renderer::new();
        renderer.draw("$ ", 2, &buffer, (0, 1));
        renderer.take();

        let change = buffer.insert_at(0, 1, "b");
        renderer.apply(&change, &buffer, 2, (0, 2));
        let out = String::from_utf8(renderer.take()).unwrap();
        assert_eq!(out, "bc\x1b[1D");
        assert_eq!(renderer.tracker().screen_position(), (0, 4));
    }

    #[test]
    fn test_apply_delete_clears_tail() {
        let mut buffer = EditBuffer::from_text("abc");
        let mut renderer = Renderer::new();
        renderer.draw("$ ", 2, &buffer, (0, 3));
        renderer.take();

        let change = buffer.delete_at(0, 2, 1);
        renderer.apply(&change, &buffer, 2, (0, 2));
        let out = String::from_utf8(renderer.take()).unwrap();
        assert_eq!(out, "\x1b[1D\x1b[K");
    }

    #[test]
    fn test_draw_multiline_and_park_cursor() {
        let buffer = sample_buffer();
        let mut renderer = Renderer::new();
        renderer.draw("$ ", 2, &buffer, (0, 1));
        let out = String::from_utf8(renderer.take()).unwrap();
        assert!(out.starts_with("$ ls\x1b[K\r\n> -la \x1b[K\r\n> 中文\x1b[K\x1b[J"));
        assert!(out.ends_with("\x1b[2A\x1b[3D"));
        assert_eq!(renderer.tracker().screen_position(), (0, 3));
    }

    #[test]
    fn test_first_line_never_uses_carriage_return() {
        let mut buffer = EditBuffer::from_text("hello");
        let mut renderer = Renderer::new();
        renderer.draw("$ ", 2, &buffer, (0, 5));
        renderer.take();
        for _ in 0..5 {
            let column = buffer.line_length(0);
            let change = buffer.delete_at(0, column - 1, 1);
            renderer.apply(&change, &buffer, 2, (0, column - 1));
        }
        let out = String::from_utf8(renderer.take()).unwrap();
        assert!(!out.contains('\r'));
    }
}
