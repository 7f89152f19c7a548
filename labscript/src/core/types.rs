//! Shared deterministic types for the simulation harness and iteration loop.
//!
//! These types define stable contracts between the harness, the controller and
//! event consumers. They carry no I/O and serialize to stable JSON shapes.

use serde::{Deserialize, Serialize};

/// Final classification of one validator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusLabel {
    /// Clean stderr and an explicit completion marker on stdout.
    Succeeded,
    /// No critical pattern, but stderr kept lines after noise removal.
    SucceededWithWarnings,
    /// Clean stderr without an explicit completion marker.
    LikelySucceeded,
    Failed,
}

impl StatusLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLabel::Succeeded => "SUCCEEDED",
            StatusLabel::SucceededWithWarnings => "SUCCEEDED_WITH_WARNINGS",
            StatusLabel::LikelySucceeded => "LIKELY_SUCCEEDED",
            StatusLabel::Failed => "FAILED",
        }
    }

    /// Human-readable status line used in transcripts and API responses.
    pub fn final_status_message(self) -> &'static str {
        match self {
            StatusLabel::Succeeded => "Simulation completed successfully",
            StatusLabel::SucceededWithWarnings => "Simulation completed with warnings",
            StatusLabel::LikelySucceeded => {
                "Simulation likely succeeded (no explicit completion message)"
            }
            StatusLabel::Failed => "Simulation failed with errors",
        }
    }
}

/// Outcome of running the validator once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub stdout: String,
    pub stderr: String,
    /// Stderr with noise lines removed; empty when nothing relevant remains.
    pub cleaned_stderr: String,
    /// Process exit status, or `-1` for harness-internal failures.
    pub return_code: i32,
    pub success: bool,
    pub has_warnings: bool,
    pub status_label: StatusLabel,
    /// Resolved validator path, when resolution succeeded.
    pub command: Option<String>,
    /// Bounded transcript (script, streams, result line) for display.
    pub transcript: String,
}

impl SimulationResult {
    /// Stream sections without the script header.
    ///
    /// This is the text the feedback extractor runs on, so the candidate
    /// script never leaks keywords into retry feedback.
    pub fn output_text(&self) -> String {
        let mut buf = format!(
            "--- STDOUT ---\n{}\n--- STDERR ---\n{}",
            self.stdout, self.stderr
        );
        if !self.cleaned_stderr.is_empty() {
            buf.push_str("\n--- Cleaned STDERR ---\n");
            buf.push_str(&self.cleaned_stderr);
        }
        buf
    }

    /// Error detail for API consumers; `None` when the run succeeded.
    pub fn error_details(&self) -> Option<&str> {
        if self.success {
            None
        } else {
            Some(&self.cleaned_stderr)
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Succeeded,
    FailedRetry,
    FailedFinal,
    GenerationError,
    /// The attempt was aborted by an unexpected fault before it could be classified.
    Error,
}

/// One generate-then-validate cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_number: u32,
    pub generated_code: Option<String>,
    pub result: Option<SimulationResult>,
    pub outcome: AttemptOutcome,
    /// Feedback or error text recorded for failed attempts.
    pub error: Option<String>,
}

/// Simulation verdict carried by `simulation_result` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationVerdict {
    Succeeded,
    Failed,
}

/// Status carried by `iteration_result` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED - WILL RETRY")]
    FailedWillRetry,
    #[serde(rename = "FAILED - MAX ATTEMPTS REACHED")]
    FailedMaxAttempts,
    #[serde(rename = "GENERATION_ERROR")]
    GenerationError,
    #[serde(rename = "ERROR")]
    Error,
}

impl IterationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationStatus::Success => "SUCCESS",
            IterationStatus::FailedWillRetry => "FAILED - WILL RETRY",
            IterationStatus::FailedMaxAttempts => "FAILED - MAX ATTEMPTS REACHED",
            IterationStatus::GenerationError => "GENERATION_ERROR",
            IterationStatus::Error => "ERROR",
        }
    }
}

/// Payload of an [`IterationEvent`], tagged by `event_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    IterationLog {
        message: String,
    },
    LlmCallStart {
        message: String,
    },
    CodeAttempt {
        /// Bounded preview; the full code stays with the attempt.
        generated_code: String,
    },
    SimulationStart {
        message: String,
    },
    SimulationResult {
        status: SimulationVerdict,
        stdout: String,
        stderr: String,
    },
    IterationResult {
        status: IterationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_details: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_code: Option<String>,
    },
}

/// Immutable record emitted to an event sink after each significant step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationEvent {
    pub attempt_number: u32,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl IterationEvent {
    pub fn new(attempt_number: u32, kind: EventKind) -> Self {
        Self {
            attempt_number,
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::IterationLog { .. } => "iteration_log",
            EventKind::LlmCallStart { .. } => "llm_call_start",
            EventKind::CodeAttempt { .. } => "code_attempt",
            EventKind::SimulationStart { .. } => "simulation_start",
            EventKind::SimulationResult { .. } => "simulation_result",
            EventKind::IterationResult { .. } => "iteration_result",
        }
    }

    /// Status of an `iteration_result` event.
    pub fn iteration_status(&self) -> Option<IterationStatus> {
        match &self.kind {
            EventKind::IterationResult { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = IterationEvent::new(
            2,
            EventKind::IterationResult {
                status: IterationStatus::FailedWillRetry,
                error_details: Some("NameError".to_string()),
                final_code: None,
            },
        );
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event_type"], "iteration_result");
        assert_eq!(json["attempt_number"], 2);
        assert_eq!(json["status"], "FAILED - WILL RETRY");
        assert!(json.get("final_code").is_none());
    }

    #[test]
    fn event_deserializes_from_tagged_json() {
        let raw = r#"{"event_type":"simulation_start","attempt_number":1,"message":"go"}"#;
        let event: IterationEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.event_type(), "simulation_start");
        assert_eq!(event.attempt_number, 1);
    }

    #[test]
    fn output_text_includes_cleaned_section_only_when_present() {
        let mut result = SimulationResult {
            stdout: "out".to_string(),
            stderr: "DEBUG: noise".to_string(),
            cleaned_stderr: String::new(),
            return_code: 0,
            success: true,
            has_warnings: false,
            status_label: StatusLabel::LikelySucceeded,
            command: None,
            transcript: String::new(),
        };
        assert!(!result.output_text().contains("Cleaned STDERR"));

        result.cleaned_stderr = "ValueError: bad volume".to_string();
        assert!(
            result
                .output_text()
                .ends_with("--- Cleaned STDERR ---\nValueError: bad volume")
        );
    }
}
