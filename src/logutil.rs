//! Sanitizing raw Base traffic so log and console output stays one line per message.

const MAX_PREVIEW: usize = 300;

/// Escape a raw wire line for single-line display:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters become `\xNN`. Surrounding whitespace is trimmed and
///   long lines are cut with an ellipsis.
pub fn escape_line(raw: &str) -> String {
    let s = raw.trim();
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
