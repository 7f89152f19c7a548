//! Pull the protocol script out of a free-form model reply.

use std::sync::LazyLock;

use regex::Regex;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:python|py)?[ \t]*\r?\n(.*?)```")
        .expect("fenced block pattern should be valid")
});

/// Lines a protocol script usually starts with.
const CODE_START_INDICATORS: &[&str] = &[
    "from opentrons",
    "import ",
    "metadata",
    "requirements",
    // Shebang and encoding lines only; a bare `#` is also a Markdown heading.
    "#!",
    "# -*-",
    "\"\"\"",
];

/// Extract the script from a model reply.
///
/// Returns the first fenced code block when present. Otherwise the reply is
/// returned from the first code-start indicator onward, or whole when there is
/// none. The result is trimmed and may be empty.
pub fn extract_code(reply: &str) -> String {
    if let Some(block) = FENCED_BLOCK
        .captures(reply)
        .and_then(|captures| captures.get(1))
    {
        return block.as_str().trim().to_string();
    }

    let trimmed = reply.trim();
    if CODE_START_INDICATORS
        .iter()
        .any(|indicator| trimmed.starts_with(indicator))
    {
        return trimmed.to_string();
    }

    let start = CODE_START_INDICATORS
        .iter()
        .filter_map(|indicator| line_start_of(trimmed, indicator))
        .min();
    match start {
        Some(idx) => trimmed[idx..].trim().to_string(),
        None => trimmed.to_string(),
    }
}

/// Byte offset of the first line that starts with `indicator`.
fn line_start_of(text: &str, indicator: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with(indicator) {
            return Some(offset + (line.len() - line.trim_start().len()));
        }
        offset += line.len();
    }
    None
}
