//! Configuration stored in `labscript.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::controller::DEFAULT_MAX_ATTEMPTS;
use crate::core::feedback::NoErrorFallback;
use crate::core::patterns::PatternTables;

pub const DEFAULT_CONFIG_FILE: &str = "labscript.toml";

/// Top-level configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to the built-in
/// defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LabscriptConfig {
    /// Attempts per session when the caller does not pass a budget.
    pub max_attempts: u32,
    pub simulator: SimulatorConfig,
    pub transcript: TranscriptConfig,
    pub feedback: FeedbackConfig,
    pub patterns: PatternTables,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Validator executable name.
    pub program: String,
    /// No-op flag used to probe a candidate executable.
    pub probe_arg: String,
    /// Value passed to `--log-level`.
    pub log_level: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Bytes of stdout/stderr kept in memory per stream.
    pub capture_limit_bytes: usize,
    /// Extra directories searched after the built-in fallbacks.
    pub search_dirs: Vec<PathBuf>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            program: "opentrons_simulate".to_string(),
            probe_arg: "--version".to_string(),
            log_level: "DEBUG".to_string(),
            timeout_secs: 60,
            probe_timeout_secs: 15,
            capture_limit_bytes: 1_000_000,
            search_dirs: Vec::new(),
        }
    }
}

impl SimulatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Transcript cap in characters.
    pub max_chars: usize,
    /// Characters kept from the start when the transcript is cut.
    pub head_chars: usize,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            max_chars: 5000,
            head_chars: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Characters of code/output shown in event previews.
    pub preview_chars: usize,
    pub fallback: NoErrorFallback,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            preview_chars: 500,
            fallback: NoErrorFallback::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads the prompt on stdin and prints the reply (e.g. `["llm"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Optional reference text (valid identifiers, example scripts) rendered into the prompt.
    pub reference_path: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
            reference_path: None,
        }
    }
}

impl Default for LabscriptConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            simulator: SimulatorConfig::default(),
            transcript: TranscriptConfig::default(),
            feedback: FeedbackConfig::default(),
            patterns: PatternTables::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl LabscriptConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.simulator.program.trim().is_empty() {
            return Err(anyhow!("simulator.program must be non-empty"));
        }
        if self.simulator.timeout_secs == 0 {
            return Err(anyhow!("simulator.timeout_secs must be > 0"));
        }
        if self.simulator.probe_timeout_secs == 0 {
            return Err(anyhow!("simulator.probe_timeout_secs must be > 0"));
        }
        if self.simulator.capture_limit_bytes == 0 {
            return Err(anyhow!("simulator.capture_limit_bytes must be > 0"));
        }
        if self.transcript.max_chars == 0 {
            return Err(anyhow!("transcript.max_chars must be > 0"));
        }
        if self.transcript.head_chars >= self.transcript.max_chars {
            return Err(anyhow!(
                "transcript.head_chars must be < transcript.max_chars"
            ));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        self.patterns.validate().context("patterns")?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LabscriptConfig::default()`.
pub fn load_config(path: &Path) -> Result<LabscriptConfig> {
    if !path.exists() {
        let cfg = LabscriptConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LabscriptConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LabscriptConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
