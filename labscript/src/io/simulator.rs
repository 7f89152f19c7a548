//! Simulation harness: run the validator against a candidate script.
//!
//! The [`Simulator`] trait decouples the iteration loop from the validator
//! process. [`ProcessSimulator`] resolves the executable, writes the script to
//! a scoped temporary file, runs it with a hard timeout, and classifies the
//! captured output. Tests use scripted simulators that return canned results.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::CancelToken;
use crate::core::classifier::classify;
use crate::core::patterns::CompiledPatterns;
use crate::core::truncate::truncate_middle;
use crate::core::types::{SimulationResult, StatusLabel};
use crate::io::config::{LabscriptConfig, TranscriptConfig};
use crate::io::process::run_command_with_timeout;
use crate::io::resolve::{ExecutableNotFound, ExecutableResolver, SearchEnv};

/// Return code reserved for harness-internal failures.
pub const HARNESS_FAILURE_CODE: i32 = -1;

/// Abstraction over validation backends.
pub trait Simulator {
    /// Validate `script`. Classified failures are `Ok` results with
    /// `success = false`; `Err` is reserved for unexpected faults.
    fn run(&self, script: &str, cancel: &CancelToken) -> Result<SimulationResult>;
}

/// Failures raised by the harness itself rather than by the script.
#[derive(Debug, Error)]
pub enum HarnessFailure {
    #[error(transparent)]
    ExecutableNotFound(#[from] ExecutableNotFound),
    #[error("Simulation timed out after {secs} seconds")]
    Timeout { secs: u64 },
    #[error("Simulation cancelled before completion")]
    Cancelled,
    #[error("Simulation harness error: {0:#}")]
    Internal(anyhow::Error),
}

/// Simulator that spawns the validator executable.
#[derive(Debug)]
pub struct ProcessSimulator {
    resolver: ExecutableResolver,
    patterns: CompiledPatterns,
    log_level: String,
    timeout: Duration,
    capture_limit_bytes: usize,
    transcript: TranscriptConfig,
    temp_dir: Option<PathBuf>,
    resolved: OnceLock<PathBuf>,
}

impl ProcessSimulator {
    /// Build from configuration, searching the current process environment.
    pub fn from_config(cfg: &LabscriptConfig) -> Result<Self> {
        Self::with_search_env(cfg, SearchEnv::from_env(&cfg.simulator.search_dirs))
    }

    pub fn with_search_env(cfg: &LabscriptConfig, env: SearchEnv) -> Result<Self> {
        let patterns = cfg.patterns.compile().context("compile pattern tables")?;
        let resolver = ExecutableResolver::new(
            &cfg.simulator.program,
            &cfg.simulator.probe_arg,
            cfg.simulator.probe_timeout(),
            env,
        );
        Ok(Self {
            resolver,
            patterns,
            log_level: cfg.simulator.log_level.clone(),
            timeout: cfg.simulator.timeout(),
            capture_limit_bytes: cfg.simulator.capture_limit_bytes,
            transcript: cfg.transcript.clone(),
            temp_dir: None,
            resolved: OnceLock::new(),
        })
    }

    /// Write temporary scripts under `dir` instead of the system temp dir.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Resolve the validator executable; a success is cached for later runs.
    pub fn resolve(&self, cancel: &CancelToken) -> Result<PathBuf, ExecutableNotFound> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }
        let path = self.resolver.resolve(cancel)?;
        Ok(self.resolved.get_or_init(|| path).clone())
    }

    fn write_script(&self, script: &str) -> Result<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("labscript-").suffix(".py");
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("create temporary script")?;
        file.write_all(script.as_bytes())
            .context("write temporary script")?;
        file.flush().context("flush temporary script")?;
        // Close the handle so the validator can open the file on every platform.
        Ok(file.into_temp_path())
    }

    fn execute(
        &self,
        program: &Path,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<SimulationResult, HarnessFailure> {
        let script_path = self.write_script(script).map_err(HarnessFailure::Internal)?;
        let command_line = format!(
            "{} {} --log-level {}",
            program.display(),
            script_path.display(),
            self.log_level
        );
        debug!(command = %command_line, "running validator");

        let mut cmd = Command::new(program);
        cmd.arg(&*script_path)
            .arg("--log-level")
            .arg(&self.log_level)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUTF8", "1");

        let output = run_command_with_timeout(
            cmd,
            None,
            cancel.clamp(self.timeout),
            self.capture_limit_bytes,
            cancel,
        )
        .map_err(HarnessFailure::Internal)?;

        if output.cancelled || (output.timed_out && cancel.is_cancelled()) {
            return Err(HarnessFailure::Cancelled);
        }
        if output.timed_out {
            return Err(HarnessFailure::Timeout {
                secs: self.timeout.as_secs(),
            });
        }

        let stdout = output.stdout_lossy().trim().to_string();
        let stderr = output.stderr_lossy().trim().to_string();
        let return_code = output
            .status
            .and_then(|status| status.code())
            .unwrap_or(HARNESS_FAILURE_CODE);
        let verdict = classify(&stdout, &stderr, return_code, &self.patterns);
        info!(
            return_code,
            status = verdict.status_label.as_str(),
            "validator finished"
        );

        let mut result = SimulationResult {
            stdout,
            stderr,
            cleaned_stderr: verdict.cleaned_stderr,
            return_code,
            success: verdict.success,
            has_warnings: verdict.has_warnings,
            status_label: verdict.status_label,
            command: Some(program.display().to_string()),
            transcript: String::new(),
        };
        result.transcript = self.render_transcript(Some(&command_line), script, &result);
        // Dropping `script_path` removes the temporary file on every return path.
        Ok(result)
    }

    fn failure_result(
        &self,
        failure: &HarnessFailure,
        program: Option<&Path>,
        script: &str,
    ) -> SimulationResult {
        let message = failure.to_string();
        let mut result = SimulationResult {
            stdout: String::new(),
            stderr: message.clone(),
            cleaned_stderr: message,
            return_code: HARNESS_FAILURE_CODE,
            success: false,
            has_warnings: false,
            status_label: StatusLabel::Failed,
            command: program.map(|p| p.display().to_string()),
            transcript: String::new(),
        };
        let header = program.map(|p| p.display().to_string());
        result.transcript = self.render_transcript(header.as_deref(), script, &result);
        result
    }

    fn render_transcript(
        &self,
        command_line: Option<&str>,
        script: &str,
        result: &SimulationResult,
    ) -> String {
        let mut buf = String::new();
        if let Some(command_line) = command_line {
            buf.push_str(&format!("Command: {command_line}\n"));
        }
        buf.push_str("--- Protocol Code ---\n");
        buf.push_str(script.trim_end());
        buf.push('\n');
        buf.push_str(&result.output_text());
        buf.push_str(&format!(
            "\n--- Result ---\nReturn code: {}\nStatus: {} ({})",
            result.return_code,
            result.status_label.as_str(),
            result.status_label.final_status_message()
        ));
        truncate_middle(&buf, self.transcript.max_chars, self.transcript.head_chars)
    }
}

impl Simulator for ProcessSimulator {
    #[instrument(skip_all, fields(program = %self.resolver.program(), script_len = script.len()))]
    fn run(&self, script: &str, cancel: &CancelToken) -> Result<SimulationResult> {
        let program = match self.resolve(cancel) {
            Ok(program) => program,
            Err(err) => {
                let failure = HarnessFailure::from(err);
                warn!(err = %failure, "validator not found");
                return Ok(self.failure_result(&failure, None, script));
            }
        };

        match self.execute(&program, script, cancel) {
            Ok(result) => Ok(result),
            Err(failure) => {
                warn!(err = %failure, "simulation failed inside the harness");
                Ok(self.failure_result(&failure, Some(&program), script))
            }
        }
    }
}
