//! Retry feedback extraction from failed simulation output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::truncate::truncate_middle;

/// Returned when no actionable text was found. Not a success signal.
pub const NO_ERRORS_FOUND: &str = "No specific errors found in simulation output";
pub const GENERAL_FAILURE: &str = "General failure detected in simulation output";
pub const WARNINGS_HEADER: &str = "Warnings found:";

const ERROR_KEYWORDS: &[&str] = &[
    "Error",
    "Exception",
    "Traceback",
    "FAILED",
    "Failed",
    "Failure",
];
const MAX_ERROR_LINES: usize = 15;
const MAX_WARNING_LINES: usize = 10;

static CLEANED_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)--- Cleaned STDERR ---\n(.*?)(?:\n---|\z)")
        .expect("cleaned stderr section pattern should be valid")
});

/// What to feed back when extraction finds nothing actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoErrorFallback {
    /// Feed the literal "no specific errors" message.
    #[default]
    Literal,
    /// Feed the raw output, bounded to the transcript limit.
    RawOutput,
}

/// Extract a concise error summary from raw simulation output.
///
/// Priority: cleaned-stderr section, traceback-like error block, warning
/// lines, a generic failure marker, then [`NO_ERRORS_FOUND`].
pub fn extract_feedback(raw_output: &str) -> String {
    if let Some(section) = cleaned_section(raw_output) {
        return section.to_string();
    }
    if let Some(block) = error_block(raw_output) {
        return block;
    }

    let warnings: Vec<&str> = raw_output
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("warning") || lower.contains("caution")
        })
        .take(MAX_WARNING_LINES)
        .collect();
    if !warnings.is_empty() {
        return format!("{WARNINGS_HEADER}\n{}", warnings.join("\n"));
    }

    if raw_output.to_uppercase().contains("FAIL") {
        return GENERAL_FAILURE.to_string();
    }
    NO_ERRORS_FOUND.to_string()
}

/// Feedback for the next attempt, applying the no-error fallback policy.
pub fn feedback_for_retry(
    raw_output: &str,
    fallback: NoErrorFallback,
    max_chars: usize,
    head_chars: usize,
) -> String {
    let extracted = extract_feedback(raw_output);
    if extracted == NO_ERRORS_FOUND && fallback == NoErrorFallback::RawOutput {
        let raw = raw_output.trim();
        if !raw.is_empty() {
            return truncate_middle(raw, max_chars, head_chars);
        }
    }
    extracted
}

fn cleaned_section(raw_output: &str) -> Option<&str> {
    let captures = CLEANED_SECTION.captures(raw_output)?;
    let body = captures.get(1)?.as_str().trim();
    (!body.is_empty()).then_some(body)
}

fn has_error_keyword(line: &str) -> bool {
    ERROR_KEYWORDS.iter().any(|keyword| line.contains(keyword))
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

/// Collect the first error block: starts at a keyword line and continues
/// through indented lines. A non-indented line ends the block; it is kept
/// when it carries a keyword itself (the closing `XError: ...` of a traceback).
fn error_block(raw_output: &str) -> Option<String> {
    let mut lines = raw_output.lines();
    let first = lines.by_ref().find(|line| has_error_keyword(line))?;

    let mut block = vec![first];
    for line in lines {
        if block.len() >= MAX_ERROR_LINES {
            break;
        }
        if is_indented(line) {
            block.push(line);
            continue;
        }
        if has_error_keyword(line) {
            block.push(line);
        }
        break;
    }
    Some(block.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaned_section_wins() {
        let raw = "--- STDOUT ---\nok\n--- STDERR ---\nDEBUG: x\nNameError: foo\n--- Cleaned STDERR ---\nNameError: foo";
        assert_eq!(extract_feedback(raw), "NameError: foo");
    }

    #[test]
    fn cleaned_section_stops_at_next_delimiter() {
        let raw = "--- Cleaned STDERR ---\nKeyError: 'A1'\n--- Result: FAILED ---";
        assert_eq!(extract_feedback(raw), "KeyError: 'A1'");
    }

    #[test]
    fn empty_cleaned_section_falls_through_to_scan() {
        let raw = "--- Cleaned STDERR ---\n   \n--- STDOUT ---\nTraceback (most recent call last):\n  File \"p.py\"\nNameError: name 'foo' is not defined\nnext line";
        let feedback = extract_feedback(raw);
        assert!(feedback.starts_with("Traceback"));
        assert!(feedback.contains("NameError"));
        assert!(!feedback.contains("next line"));
    }

    #[test]
    fn error_block_ends_at_plain_line() {
        let raw = "header\nValueError: bad volume\nplain trailing line";
        assert_eq!(extract_feedback(raw), "ValueError: bad volume");
    }

    #[test]
    fn error_block_is_capped() {
        let mut raw = String::from("Traceback (most recent call last):\n");
        for i in 0..40 {
            raw.push_str(&format!("  frame {i}\n"));
        }
        let feedback = extract_feedback(&raw);
        assert_eq!(feedback.lines().count(), MAX_ERROR_LINES);
    }

    #[test]
    fn warnings_are_listed_with_header() {
        let mut raw = String::new();
        for i in 0..12 {
            raw.push_str(&format!("warning {i}: check tips\n"));
        }
        let feedback = extract_feedback(&raw);
        assert!(feedback.starts_with(WARNINGS_HEADER));
        assert_eq!(feedback.lines().count(), MAX_WARNING_LINES + 1);
    }

    #[test]
    fn generic_failure_marker() {
        assert_eq!(extract_feedback("status: fail"), GENERAL_FAILURE);
    }

    #[test]
    fn nothing_found_returns_literal() {
        assert_eq!(extract_feedback("all quiet"), NO_ERRORS_FOUND);
    }

    #[test]
    fn raw_output_fallback_replaces_literal() {
        let raw = "exit code 3, nothing printed";
        assert_eq!(
            feedback_for_retry(raw, NoErrorFallback::Literal, 100, 20),
            NO_ERRORS_FOUND
        );
        assert_eq!(feedback_for_retry(raw, NoErrorFallback::RawOutput, 100, 20), raw);
    }

    #[test]
    fn raw_output_fallback_keeps_extracted_errors() {
        let raw = "ValueError: bad volume";
        assert_eq!(
            feedback_for_retry(raw, NoErrorFallback::RawOutput, 100, 20),
            "ValueError: bad volume"
        );
    }
}
