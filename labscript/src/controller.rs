//! Bounded-retry loop that turns generation and validation into a
//! self-correcting pipeline.
//!
//! Each attempt generates a script from the session's working prompt, runs it
//! through the simulator, and either stops on success or appends the extracted
//! error to the working prompt for the next attempt.

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::budget::CancelToken;
use crate::core::feedback::{NoErrorFallback, feedback_for_retry};
use crate::core::truncate::preview;
use crate::core::types::{
    Attempt, AttemptOutcome, EventKind, IterationEvent, IterationStatus, SimulationResult,
    SimulationVerdict,
};
use crate::io::config::LabscriptConfig;
use crate::io::generator::{GenerationError, GenerationRequest, Generator};
use crate::io::reporter::EventSink;
use crate::io::simulator::Simulator;

/// Prefix of every failure string returned by [`generate_protocol`].
pub const ERROR_MARKER: &str = "Error: ";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Knobs for one controller run.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Budget used when the caller does not pass one.
    pub default_max_attempts: u32,
    /// Characters of code and output carried in event previews.
    pub preview_chars: usize,
    pub fallback: NoErrorFallback,
    /// Bound for raw-output feedback under [`NoErrorFallback::RawOutput`].
    pub feedback_max_chars: usize,
    pub feedback_head_chars: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&LabscriptConfig::default())
    }
}

impl ControllerConfig {
    pub fn from_config(cfg: &LabscriptConfig) -> Self {
        Self {
            default_max_attempts: cfg.max_attempts,
            preview_chars: cfg.feedback.preview_chars,
            fallback: cfg.feedback.fallback,
            feedback_max_chars: cfg.transcript.max_chars,
            feedback_head_chars: cfg.transcript.head_chars,
        }
    }
}

/// Per-request state owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    hardware_context: String,
    working_prompt: String,
    max_attempts: u32,
    attempts: Vec<Attempt>,
}

impl Session {
    pub fn new(goal: &str, hardware_context: &str, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(anyhow!("max_attempts must be a positive integer"));
        }
        Ok(Self {
            hardware_context: hardware_context.to_string(),
            working_prompt: goal.to_string(),
            max_attempts,
            attempts: Vec::new(),
        })
    }

    pub fn hardware_context(&self) -> &str {
        &self.hardware_context
    }

    pub fn working_prompt(&self) -> &str {
        &self.working_prompt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    fn append_feedback(&mut self, attempt_number: u32, error: &str) {
        self.working_prompt.push_str(&format!(
            "\n\n--- PREVIOUS SIMULATION ERROR (Attempt {attempt_number}) ---\n{error}\n--- Please fix the above error in the next code generation ---"
        ));
    }

    fn record(&mut self, attempt: Attempt) {
        debug_assert_eq!(attempt.attempt_number as usize, self.attempts.len() + 1);
        self.attempts.push(attempt);
    }
}

/// Terminal state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Succeeded { code: String },
    /// Every attempt was used without a passing simulation.
    Exhausted { attempts: u32, last_error: String },
    /// Generation failed on the last attempt.
    Fatal { attempt: u32, error: String },
    /// The cancel token fired; no further attempts were started.
    Cancelled {
        attempts: u32,
        last_error: Option<String>,
    },
}

/// Outcome plus the final session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub session: Session,
}

impl SessionReport {
    pub fn code(&self) -> Option<&str> {
        match &self.outcome {
            SessionOutcome::Succeeded { code } => Some(code),
            _ => None,
        }
    }

    pub fn attempts_used(&self) -> u32 {
        self.session.attempts.len() as u32
    }

    /// Render as the entry-point string: the code, or an `Error: ` message.
    pub fn render(&self) -> String {
        match &self.outcome {
            SessionOutcome::Succeeded { code } => code.clone(),
            SessionOutcome::Exhausted {
                attempts,
                last_error,
            } => format!(
                "{ERROR_MARKER}Code generation failed after {attempts} attempts. Last error: {last_error}"
            ),
            SessionOutcome::Fatal { attempt, error } => format!(
                "{ERROR_MARKER}Code generation failed after {attempt} attempts. Last error: {error}"
            ),
            SessionOutcome::Cancelled {
                attempts,
                last_error,
            } => match last_error {
                Some(err) => format!(
                    "{ERROR_MARKER}Code generation cancelled after {attempts} attempts. Last error: {err}"
                ),
                None => format!("{ERROR_MARKER}Code generation cancelled after {attempts} attempts."),
            },
        }
    }
}

struct Emitter<'a> {
    sink: &'a mut dyn EventSink,
}

impl Emitter<'_> {
    fn emit(&mut self, attempt_number: u32, kind: EventKind) {
        self.sink.report(&IterationEvent::new(attempt_number, kind));
    }

    fn iteration_result(
        &mut self,
        attempt_number: u32,
        status: IterationStatus,
        error_details: Option<String>,
        final_code: Option<String>,
    ) {
        self.emit(
            attempt_number,
            EventKind::IterationResult {
                status,
                error_details,
                final_code,
            },
        );
    }
}

/// Collaborators shared by every attempt of a session.
pub struct Pipeline<'a, G: ?Sized, S: ?Sized> {
    pub generator: &'a G,
    pub simulator: &'a S,
    pub config: &'a ControllerConfig,
    pub cancel: &'a CancelToken,
}

/// Drive the attempt loop until success, exhaustion, a fatal generation
/// failure, or cancellation.
#[instrument(skip_all, fields(max_attempts = session.max_attempts))]
pub fn run_session<G, S>(
    mut session: Session,
    pipeline: &Pipeline<'_, G, S>,
    sink: &mut dyn EventSink,
) -> SessionReport
where
    G: Generator + ?Sized,
    S: Simulator + ?Sized,
{
    let mut emitter = Emitter { sink };
    let outcome = run_attempts(&mut session, pipeline, &mut emitter);
    match &outcome {
        SessionOutcome::Succeeded { .. } => {
            info!(attempts = session.attempts.len(), "session succeeded");
        }
        other => {
            warn!(attempts = session.attempts.len(), outcome = ?other, "session did not succeed");
        }
    }
    SessionReport { outcome, session }
}

fn run_attempts<G, S>(
    session: &mut Session,
    pipeline: &Pipeline<'_, G, S>,
    emitter: &mut Emitter<'_>,
) -> SessionOutcome
where
    G: Generator + ?Sized,
    S: Simulator + ?Sized,
{
    let Pipeline {
        generator,
        simulator,
        config,
        cancel,
    } = *pipeline;
    let max = session.max_attempts;
    let mut last_error: Option<String> = None;

    for n in 1..=max {
        if cancel.is_cancelled() {
            return SessionOutcome::Cancelled {
                attempts: n - 1,
                last_error,
            };
        }
        info!(attempt = n, max, "starting attempt");
        emitter.emit(
            n,
            EventKind::IterationLog {
                message: format!("Starting attempt {n} of {max}"),
            },
        );
        emitter.emit(
            n,
            EventKind::LlmCallStart {
                message: format!("Generating protocol code (attempt {n})"),
            },
        );

        let request = GenerationRequest {
            hardware_context: &session.hardware_context,
            working_prompt: &session.working_prompt,
            attempt: n,
        };
        let code = match generator.generate(&request) {
            Ok(code) => code,
            Err(err) => {
                let message = format!("Code generation failed: {err}");
                warn!(attempt = n, err = %err, "generation failed");
                emitter.iteration_result(
                    n,
                    IterationStatus::GenerationError,
                    Some(message.clone()),
                    None,
                );
                session.record(Attempt {
                    attempt_number: n,
                    generated_code: None,
                    result: None,
                    outcome: AttemptOutcome::GenerationError,
                    error: Some(message.clone()),
                });
                if matches!(err, GenerationError::Cancelled) || cancel.is_cancelled() {
                    return SessionOutcome::Cancelled {
                        attempts: n,
                        last_error: Some(message),
                    };
                }
                if n == max {
                    return SessionOutcome::Fatal {
                        attempt: n,
                        error: message,
                    };
                }
                last_error = Some(message);
                continue;
            }
        };

        emitter.emit(
            n,
            EventKind::CodeAttempt {
                generated_code: preview(&code, config.preview_chars),
            },
        );
        emitter.emit(
            n,
            EventKind::SimulationStart {
                message: format!("Running simulation (attempt {n})"),
            },
        );

        let result = match simulator.run(&code, cancel) {
            Ok(result) => result,
            Err(err) => {
                let message = format!("Unexpected error during attempt {n}: {err:#}");
                warn!(attempt = n, err = %message, "attempt aborted");
                emitter.iteration_result(n, IterationStatus::Error, Some(message.clone()), None);
                session.record(Attempt {
                    attempt_number: n,
                    generated_code: Some(code),
                    result: None,
                    outcome: AttemptOutcome::Error,
                    error: Some(message.clone()),
                });
                if n == max {
                    return SessionOutcome::Exhausted {
                        attempts: n,
                        last_error: message,
                    };
                }
                last_error = Some(message);
                continue;
            }
        };

        if result.success {
            emitter.emit(
                n,
                simulation_event(SimulationVerdict::Succeeded, &result, &result.cleaned_stderr, config),
            );
            emitter.iteration_result(n, IterationStatus::Success, None, Some(code.clone()));
            session.record(Attempt {
                attempt_number: n,
                generated_code: Some(code.clone()),
                result: Some(result),
                outcome: AttemptOutcome::Succeeded,
                error: None,
            });
            return SessionOutcome::Succeeded { code };
        }

        if cancel.is_cancelled() {
            let message = result.cleaned_stderr.clone();
            emitter.iteration_result(n, IterationStatus::Error, Some(message.clone()), None);
            session.record(Attempt {
                attempt_number: n,
                generated_code: Some(code),
                result: Some(result),
                outcome: AttemptOutcome::Error,
                error: Some(message.clone()),
            });
            return SessionOutcome::Cancelled {
                attempts: n,
                last_error: Some(message),
            };
        }

        let error = feedback_for_retry(
            &result.output_text(),
            config.fallback,
            config.feedback_max_chars,
            config.feedback_head_chars,
        );
        emitter.emit(
            n,
            simulation_event(SimulationVerdict::Failed, &result, &error, config),
        );

        if n < max {
            session.append_feedback(n, &error);
            emitter.iteration_result(
                n,
                IterationStatus::FailedWillRetry,
                Some(error.clone()),
                None,
            );
            session.record(Attempt {
                attempt_number: n,
                generated_code: Some(code),
                result: Some(result),
                outcome: AttemptOutcome::FailedRetry,
                error: Some(error.clone()),
            });
            last_error = Some(error);
        } else {
            emitter.iteration_result(
                n,
                IterationStatus::FailedMaxAttempts,
                Some(error.clone()),
                None,
            );
            session.record(Attempt {
                attempt_number: n,
                generated_code: Some(code),
                result: Some(result),
                outcome: AttemptOutcome::FailedFinal,
                error: Some(error.clone()),
            });
            return SessionOutcome::Exhausted {
                attempts: n,
                last_error: error,
            };
        }
    }

    // Only reachable when the loop body never returned on the last attempt.
    SessionOutcome::Exhausted {
        attempts: max,
        last_error: last_error.unwrap_or_default(),
    }
}

fn simulation_event(
    status: SimulationVerdict,
    result: &SimulationResult,
    error: &str,
    config: &ControllerConfig,
) -> EventKind {
    EventKind::SimulationResult {
        status,
        stdout: preview(&result.output_text(), config.preview_chars),
        stderr: preview(error, config.preview_chars),
    }
}

/// Public entry point: returns the final code, or a string starting with
/// [`ERROR_MARKER`] that names the attempts used and the last error.
pub fn generate_protocol<G, S>(
    goal: &str,
    hardware_context: &str,
    max_attempts: Option<u32>,
    pipeline: &Pipeline<'_, G, S>,
    sink: &mut dyn EventSink,
) -> String
where
    G: Generator + ?Sized,
    S: Simulator + ?Sized,
{
    let max_attempts = max_attempts.unwrap_or(pipeline.config.default_max_attempts);
    match Session::new(goal, hardware_context, max_attempts) {
        Ok(session) => run_session(session, pipeline, sink).render(),
        Err(err) => format!("{ERROR_MARKER}{err}"),
    }
}
