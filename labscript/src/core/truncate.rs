//! Character-bounded truncation for transcripts and event previews.
//!
//! Lengths are counted in `char`s so multi-byte output never splits a code point.

pub const TRUNCATION_MARKER: &str = "\n... [Simulation output truncated for brevity] ...\n";

/// Cap `text` at `max_chars`, keeping `head_chars` from the start, the marker,
/// and as much of the end as fits. The result is exactly `max_chars` long when
/// truncation happens.
///
/// Callers must keep `head_chars + marker length < max_chars`; otherwise the
/// head is shrunk to make room for the marker and at least one tail char.
pub fn truncate_middle(text: &str, max_chars: usize, head_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len + 1 {
        return text.chars().take(max_chars).collect();
    }
    let head = head_chars.min(max_chars - marker_len - 1);
    let tail = max_chars - marker_len - head;

    let mut out = String::with_capacity(max_chars * 4);
    out.extend(text.chars().take(head));
    out.push_str(TRUNCATION_MARKER);
    out.extend(text.chars().skip(total - tail));
    out
}

/// First `max_chars` characters of `text`.
pub fn head(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// First `max_chars` characters plus `...` when `text` is longer.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", head(text, max_chars))
    } else {
        text.to_string()
    }
}
