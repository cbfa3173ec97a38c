//! Terminal rendering of node replies, in the style redis-cli users know.

use colored::Colorize;
use trib_protocol::Frame;

/// Formats a reply for display.
///
/// - status replies: green
/// - errors: red with an `(error)` prefix
/// - integers: yellow with an `(integer)` prefix
/// - bulk strings: quoted, unless multiline (`INFO`, `CLUSTER NODES`)
/// - nil: dim `(nil)`
/// - arrays and maps: numbered, nested entries indented
pub fn format_reply(frame: &Frame) -> String {
    format_frame(frame)
}

/// Strips ANSI escapes and control characters from node-supplied text.
/// Tabs and line breaks survive.
pub(crate) fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.next() == Some('[') {
                // CSI runs until a letter
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if matches!(ch, '\t' | '\n' | '\r') || !ch.is_control() {
            out.push(ch);
        }
    }
    out
}

fn format_frame(frame: &Frame) -> String {
    match frame {
        Frame::Simple(s) => sanitize(s).green().to_string(),
        Frame::Error(e) => format!("{} {}", "(error)".red(), sanitize(e).red()),
        Frame::Integer(n) => format!("{} {}", "(integer)".yellow(), n.to_string().yellow()),
        Frame::Bulk(data) => match std::str::from_utf8(data) {
            Ok(s) if s.contains('\n') => sanitize(s).green().to_string(),
            Ok(s) => format!("\"{}\"", sanitize(s)).green().to_string(),
            Err(_) => {
                let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
                hex.green().to_string()
            }
        },
        Frame::Null => "(nil)".dimmed().to_string(),
        Frame::Array(items) if items.is_empty() => "(empty array)".dimmed().to_string(),
        Frame::Array(items) => numbered(items.iter().map(format_frame)),
        Frame::Map(pairs) if pairs.is_empty() => "(empty map)".dimmed().to_string(),
        Frame::Map(pairs) => numbered(
            pairs
                .iter()
                .map(|(k, v)| format!("{} => {}", format_frame(k), format_frame(v))),
        ),
    }
}

/// Numbers entries; continuation lines of nested entries are indented.
fn numbered(entries: impl Iterator<Item = String>) -> String {
    entries
        .enumerate()
        .map(|(i, entry)| format!("{}) {}", i + 1, entry.replace('\n', "\n   ")))
        .collect::<Vec<_>>()
        .join("\n")
}
