//! Deterministic classification of validator output.

use crate::core::patterns::{CompiledPatterns, contains_any};
use crate::core::types::StatusLabel;

/// Verdict for one `(stdout, stderr, return_code)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub cleaned_stderr: String,
    pub success: bool,
    pub has_warnings: bool,
    pub status_label: StatusLabel,
}

/// Remove noise lines from stderr.
///
/// A line is noise when it is blank, matches a debug/info log prefix, or
/// case-insensitively contains a noise phrase. Kept lines are trimmed.
pub fn clean_stderr(stderr: &str, patterns: &CompiledPatterns) -> String {
    stderr
        .lines()
        .filter(|line| !is_noise_line(line, patterns))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_noise_line(line: &str, patterns: &CompiledPatterns) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    if patterns.log_prefixes.iter().any(|re| re.is_match(line)) {
        return true;
    }
    contains_any(&line.to_lowercase(), &patterns.noise)
}

/// Classify one validator run.
///
/// - Any critical pattern in cleaned stderr, an always-critical marker in raw
///   stderr, a failure sentinel on stdout, or a non-zero return code is `FAILED`.
/// - Otherwise non-empty cleaned stderr is `SUCCEEDED_WITH_WARNINGS`.
/// - Otherwise a completion marker on stdout is `SUCCEEDED`, else `LIKELY_SUCCEEDED`.
pub fn classify(
    stdout: &str,
    stderr: &str,
    return_code: i32,
    patterns: &CompiledPatterns,
) -> Classification {
    let cleaned_stderr = clean_stderr(stderr, patterns);
    let cleaned_lower = cleaned_stderr.to_lowercase();
    let stdout_lower = stdout.to_lowercase();

    let critical_in_cleaned = contains_any(&cleaned_lower, &patterns.critical);
    let critical_in_raw = patterns
        .always_critical
        .iter()
        .any(|marker| stderr.contains(marker.as_str()));
    let critical_in_stdout = contains_any(&stdout_lower, &patterns.stdout_failure);

    let success = return_code == 0 && !critical_in_cleaned && !critical_in_raw && !critical_in_stdout;
    let has_warnings = !cleaned_stderr.is_empty() && !critical_in_cleaned;

    let status_label = if !success {
        StatusLabel::Failed
    } else if !cleaned_stderr.is_empty() {
        StatusLabel::SucceededWithWarnings
    } else if contains_any(&stdout_lower, &patterns.completion) {
        StatusLabel::Succeeded
    } else {
        StatusLabel::LikelySucceeded
    };

    Classification {
        cleaned_stderr,
        success,
        has_warnings,
        status_label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> CompiledPatterns {
        CompiledPatterns::defaults().expect("default patterns")
    }

    #[test]
    fn completion_marker_without_stderr_succeeds() {
        let c = classify("Protocol complete", "", 0, &patterns());
        assert_eq!(c.status_label, StatusLabel::Succeeded);
        assert!(c.success);
        assert!(!c.has_warnings);
        assert_eq!(c.cleaned_stderr, "");
    }

    #[test]
    fn name_error_with_nonzero_exit_fails() {
        let stderr = "Traceback (most recent call last):\n  File \"p.py\", line 3\nNameError: name 'foo' is not defined";
        let c = classify("", stderr, 1, &patterns());
        assert_eq!(c.status_label, StatusLabel::Failed);
        assert!(!c.success);
        assert!(c.cleaned_stderr.contains("NameError"));
    }

    #[test]
    fn calibration_noise_is_stripped() {
        let stderr = "Calibration data not found\nDefaulting to global settings";
        let c = classify("", stderr, 0, &patterns());
        assert_eq!(c.cleaned_stderr, "");
        assert!(c.success);
        assert!(matches!(
            c.status_label,
            StatusLabel::Succeeded | StatusLabel::LikelySucceeded
        ));
    }

    #[test]
    fn noise_only_without_marker_is_likely_succeeded() {
        let stderr = "DEBUG: loading deck\nINFO: homing\n\nFailed to initialize USB";
        let c = classify("moved 10 uL", stderr, 0, &patterns());
        assert_eq!(c.status_label, StatusLabel::LikelySucceeded);
        assert!(c.success);
    }

    #[test]
    fn traceback_fails_even_with_zero_exit() {
        let c = classify("Protocol complete", "Traceback (most recent call last):", 0, &patterns());
        assert_eq!(c.status_label, StatusLabel::Failed);
        assert!(!c.success);
    }

    #[test]
    fn traceback_inside_debug_line_still_fails() {
        let c = classify("", "DEBUG: Traceback (most recent call last):", 0, &patterns());
        assert_eq!(c.cleaned_stderr, "");
        assert_eq!(c.status_label, StatusLabel::Failed);
    }

    #[test]
    fn unexpected_stderr_is_a_warning() {
        let c = classify(
            "Protocol complete",
            "UserWarning: tip reuse detected",
            0,
            &patterns(),
        );
        assert_eq!(c.status_label, StatusLabel::SucceededWithWarnings);
        assert!(c.success);
        assert!(c.has_warnings);
        assert_eq!(c.cleaned_stderr, "UserWarning: tip reuse detected");
    }

    #[test]
    fn generic_failed_line_fails_with_zero_exit() {
        let c = classify(
            "",
            "Failed to load labware 'corning_96' in slot 1",
            0,
            &patterns(),
        );
        assert_eq!(c.status_label, StatusLabel::Failed);
        assert!(!c.success);
        assert!(!c.has_warnings);
        assert!(c.cleaned_stderr.contains("corning_96"));
    }

    #[test]
    fn failed_noise_phrase_stays_benign() {
        let c = classify("Protocol complete", "Failed to initialize USB", 0, &patterns());
        assert_eq!(c.status_label, StatusLabel::Succeeded);
        assert!(c.success);
    }

    #[test]
    fn stdout_failure_sentinel_fails() {
        let c = classify("Protocol analysis failed: bad slot", "", 0, &patterns());
        assert_eq!(c.status_label, StatusLabel::Failed);
    }

    #[test]
    fn nonzero_exit_with_warning_text_is_failed_with_warnings_flag() {
        let c = classify("", "caution: slow aspirate", 2, &patterns());
        assert_eq!(c.status_label, StatusLabel::Failed);
        assert!(!c.success);
        assert!(c.has_warnings);
    }

    #[test]
    fn classification_is_deterministic() {
        let p = patterns();
        let first = classify("run() finished", "KeyError: 'A1'", 0, &p);
        for _ in 0..5 {
            assert_eq!(classify("run() finished", "KeyError: 'A1'", 0, &p), first);
        }
    }
}
