//! Event sinks for iteration progress.
//!
//! Reporting is fire-and-forget: sinks never fail from the controller's point
//! of view. Sink-side I/O problems are logged and swallowed.

use std::io::Write;

use tracing::{info, warn};

use crate::core::truncate::preview;
use crate::core::types::{EventKind, IterationEvent};

/// Characters of error text shown on a progress line.
const PROGRESS_ERROR_CHARS: usize = 200;

/// Consumer of iteration events, called synchronously in emission order.
pub trait EventSink {
    fn report(&mut self, event: &IterationEvent);
}

impl<F> EventSink for F
where
    F: FnMut(&IterationEvent),
{
    fn report(&mut self, event: &IterationEvent) {
        self(event);
    }
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn report(&mut self, event: &IterationEvent) {
        let attempt = event.attempt_number;
        match &event.kind {
            EventKind::IterationLog { message }
            | EventKind::LlmCallStart { message }
            | EventKind::SimulationStart { message } => {
                info!(attempt, event_type = event.event_type(), "{message}");
            }
            EventKind::CodeAttempt { generated_code } => {
                info!(attempt, code_len = generated_code.len(), "code generated");
            }
            EventKind::SimulationResult { status, .. } => {
                info!(attempt, status = ?status, "simulation finished");
            }
            EventKind::IterationResult {
                status,
                error_details,
                ..
            } => match error_details {
                Some(details) => {
                    info!(attempt, status = status.as_str(), error = %details, "iteration finished");
                }
                None => info!(attempt, status = status.as_str(), "iteration finished"),
            },
        }
    }
}

/// In-memory collector.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    pub events: Vec<IterationEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> &[IterationEvent] {
        &self.events[self.events.len().saturating_sub(n)..]
    }
}

impl EventSink for EventLog {
    fn report(&mut self, event: &IterationEvent) {
        self.events.push(event.clone());
    }
}

/// Writes one JSON object per event.
pub struct JsonlSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonlSink<W> {
    fn report(&mut self, event: &IterationEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(err = %err, "failed to serialize event");
                return;
            }
        };
        if let Err(err) = writeln!(self.writer, "{line}").and_then(|()| self.writer.flush()) {
            warn!(err = %err, "failed to write event");
        }
    }
}

/// Human-readable progress: one line when an attempt starts and one when it
/// ends. Other events are skipped.
pub struct ProgressSink<W: Write> {
    writer: W,
}

impl<W: Write> ProgressSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Progress line for `event`, if it is one worth showing.
pub fn progress_line(event: &IterationEvent) -> Option<String> {
    let attempt = event.attempt_number;
    match &event.kind {
        EventKind::IterationLog { message } => Some(format!("[attempt {attempt}] {message}")),
        EventKind::IterationResult {
            status,
            error_details,
            ..
        } => {
            let first_error_line = error_details
                .as_deref()
                .and_then(|details| details.lines().map(str::trim).find(|l| !l.is_empty()));
            Some(match first_error_line {
                Some(line) => format!(
                    "[attempt {attempt}] {}: {}",
                    status.as_str(),
                    preview(line, PROGRESS_ERROR_CHARS)
                ),
                None => format!("[attempt {attempt}] {}", status.as_str()),
            })
        }
        _ => None,
    }
}

impl<W: Write> EventSink for ProgressSink<W> {
    fn report(&mut self, event: &IterationEvent) {
        let Some(line) = progress_line(event) else {
            return;
        };
        if let Err(err) = writeln!(self.writer, "{line}").and_then(|()| self.writer.flush()) {
            warn!(err = %err, "failed to write progress");
        }
    }
}

/// Forwards every event to two sinks in order.
pub struct Fanout<A, B>(pub A, pub B);

impl<A: EventSink, B: EventSink> EventSink for Fanout<A, B> {
    fn report(&mut self, event: &IterationEvent) {
        self.0.report(event);
        self.1.report(event);
    }
}
