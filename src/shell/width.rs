//! Display width of characters
//!
//! Every cursor offset the editor computes goes through [`width_of`], so the
//! buffer, the cursor tracker and the prompt all agree on column counts.

use unicode_width::UnicodeWidthChar;

/// Terminal columns occupied by `c`: 2 for wide (CJK, fullwidth) characters,
/// 1 for everything else.
///
/// Combining and other zero-width characters also count as 1, because every
/// buffer character is a cursor stop. Terminals draw them in 0 columns, so
/// on decomposed text the tracked cursor ends up one column right of the
/// real one per mark until the line is redrawn.
pub fn width_of(c: char) -> usize {
    match UnicodeWidthChar::width(c) {
        Some(2) => 2,
        _ => 1,
    }
}

/// Per-character widths of `chars`.
pub fn widths_of(chars: &[char]) -> Vec<usize> {
    chars.iter().map(|&c| width_of(c)).collect()
}

/// Total display width of a plain string.
pub fn str_width(s: &str) -> usize {
    s.chars().map(width_of).sum()
}

/// Display width of a string that may carry CSI styling sequences.
#[cfg(test)]
pub fn visible_width(s: &str) -> usize {
    let mut width = 0;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next(); // '['
            for seq_char in chars.by_ref() {
                if matches!(seq_char as u32, 0x40..=0x7E) {
                    break;
                }
            }
            continue;
        }
        if c.is_control() {
            continue;
        }
        width += width_of(c);
    }
    width
}
