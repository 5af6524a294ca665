//! Severity classification and truncation of captured script output

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Keywords that make a log excerpt worth a warning notification
pub const WARNING_KEYWORDS: [&str; 3] = ["error", "fatal", "warning"];

/// CSI sequences (colors, cursor moves), OSC sequences (titles, hyperlinks)
/// and the remaining two-byte escapes, in that order.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]")
        .expect("ANSI escape pattern is valid")
});

/// Removes terminal escape sequences so keyword matching and chat display
/// are not corrupted by color codes.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// True if `text` contains (case-insensitively) any of [`WARNING_KEYWORDS`].
pub fn is_warning_worthy(text: &str) -> bool {
    let lowered = strip_ansi(text).to_lowercase();
    WARNING_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Keeps the last `max_lines` lines of `text`, in order, joined with `\n`.
pub fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Keeps the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Keeps the first `max_chars` characters of `text`.
pub fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Length of `text` in UTF-16 code units, the unit chat APIs count in.
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Keeps the first `max_units` UTF-16 code units of `text`, never splitting a character.
pub fn head_utf16(text: &str, max_units: usize) -> &str {
    let mut used = 0;
    for (idx, c) in text.char_indices() {
        used += c.len_utf16();
        if used > max_units {
            return &text[..idx];
        }
    }
    text
}

/// Keeps the last `max_units` UTF-16 code units of `text`, never splitting a character.
pub fn tail_utf16(text: &str, max_units: usize) -> &str {
    let mut used = 0;
    for (idx, c) in text.char_indices().rev() {
        used += c.len_utf16();
        if used > max_units {
            return &text[idx + c.len_utf8()..];
        }
    }
    text
}
