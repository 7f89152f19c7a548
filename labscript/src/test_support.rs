//! Test-only collaborators: scripted generators and simulators, event helpers,
//! and fake validator executables.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::budget::CancelToken;
use crate::core::classifier::classify;
use crate::core::patterns::CompiledPatterns;
use crate::core::types::{IterationEvent, IterationStatus, SimulationResult};
use crate::io::config::LabscriptConfig;
use crate::io::generator::{GenerationError, GenerationRequest, Generator};
use crate::io::resolve::SearchEnv;
use crate::io::simulator::Simulator;

/// Generation request as seen by a scripted generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub hardware_context: String,
    pub working_prompt: String,
    pub attempt: u32,
}

/// Generator that replays canned replies in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: RefCell<VecDeque<Result<String, GenerationError>>>,
    requests: RefCell<Vec<RecordedRequest>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Generator that returns `code` for every call.
    pub fn repeating(code: &str, times: usize) -> Self {
        Self::new((0..times).map(|_| Ok(code.to_string())).collect())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        self.requests.borrow_mut().push(RecordedRequest {
            hardware_context: request.hardware_context.to_string(),
            working_prompt: request.working_prompt.to_string(),
            attempt: request.attempt,
        });
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(GenerationError::EmptyResponse))
    }
}

/// One canned simulator response.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Result(SimulationResult),
    /// An unexpected harness fault surfaced as `Err`.
    Fault(String),
}

/// Simulator that replays canned results in order and records every script.
#[derive(Debug, Default)]
pub struct ScriptedSimulator {
    runs: RefCell<VecDeque<ScriptedRun>>,
    scripts: RefCell<Vec<String>>,
    cancel_on_run: Option<CancelToken>,
}

impl ScriptedSimulator {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            ..Self::default()
        }
    }

    /// Cancel `token` at the start of every run, as a client disconnect would.
    pub fn cancelling(mut self, token: CancelToken) -> Self {
        self.cancel_on_run = Some(token);
        self
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.borrow().clone()
    }
}

impl Simulator for ScriptedSimulator {
    fn run(&self, script: &str, _cancel: &CancelToken) -> Result<SimulationResult> {
        if let Some(token) = &self.cancel_on_run {
            token.cancel();
        }
        self.scripts.borrow_mut().push(script.to_string());
        match self.runs.borrow_mut().pop_front() {
            Some(ScriptedRun::Result(result)) => Ok(result),
            Some(ScriptedRun::Fault(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted simulation left")),
        }
    }
}

/// Classify `(stdout, stderr, return_code)` with the default tables into a result.
pub fn simulation(stdout: &str, stderr: &str, return_code: i32) -> SimulationResult {
    let patterns = CompiledPatterns::defaults().expect("default patterns compile");
    let verdict = classify(stdout, stderr, return_code, &patterns);
    SimulationResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        cleaned_stderr: verdict.cleaned_stderr,
        return_code,
        success: verdict.success,
        has_warnings: verdict.has_warnings,
        status_label: verdict.status_label,
        command: Some("opentrons_simulate".to_string()),
        transcript: String::new(),
    }
}

/// A clean, explicitly completed run.
pub fn passed() -> ScriptedRun {
    ScriptedRun::Result(simulation("Protocol complete", "", 0))
}

/// A run that failed with `error` on stderr.
pub fn failed(error: &str) -> ScriptedRun {
    ScriptedRun::Result(simulation("", error, 1))
}

/// `event_type` of each event, in order.
pub fn event_types(events: &[IterationEvent]) -> Vec<&'static str> {
    events.iter().map(IterationEvent::event_type).collect()
}

/// Statuses of the `iteration_result` events, in order.
pub fn iteration_statuses(events: &[IterationEvent]) -> Vec<IterationStatus> {
    events
        .iter()
        .filter_map(IterationEvent::iteration_status)
        .collect()
}

/// Write an executable shell script acting as the validator.
///
/// `--version` always exits 0; any other invocation runs `body` with the
/// script path in `$1`.
#[cfg(unix)]
pub fn write_fake_validator(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"{name} 0.0.0\"\n  exit 0\nfi\n{body}\n"
    );
    fs::write(&path, script).expect("write fake validator");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake validator");
    path
}

/// Config and search environment that find only validators in `dir`.
pub fn isolated_validator_env(dir: &Path, program: &str) -> (LabscriptConfig, SearchEnv) {
    let mut cfg = LabscriptConfig::default();
    cfg.simulator.program = program.to_string();
    cfg.simulator.timeout_secs = 10;
    cfg.simulator.probe_timeout_secs = 5;
    cfg.simulator.search_dirs = vec![dir.to_path_buf()];
    let env = SearchEnv {
        path: Some(std::ffi::OsString::new()),
        extra_dirs: vec![dir.to_path_buf()],
        ..SearchEnv::default()
    };
    (cfg, env)
}
