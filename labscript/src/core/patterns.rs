//! Pattern tables that drive output classification.
//!
//! The validator's diagnostic wording belongs to the external tool, so the
//! tables are plain data: they deserialize from `[patterns]` in the config and
//! fall back to the built-in defaults below.

use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

const DEFAULT_NOISE: &[&str] = &[
    "robot_settings.json not found",
    "deck_calibration.json not found",
    "pipette_calibration.json not found",
    "tip_length_calibrations.json not found",
    "Belt calibration not found",
    "Gantry calibration not found",
    "Deck calibration not found",
    "Calibration data not found",
    "Defaulting to global settings",
    "Failed to initialize USB",
    "Failed to connect to /dev/ttyAMA0",
    "Smoothie stats not available",
    "No valid configuration for USB-connected GEN2 pipette",
    "falling back to default values",
    "Please calibrate your deck.",
    "This robot has not been calibrated",
    "Deck calibration is not valid",
    "Failed to find any valid hardware modules",
    "Failed to find smoothie board",
    "Deck calibration file",
];

const DEFAULT_LOG_PREFIXES: &[&str] = &[r"^\s*DEBUG\b[:\s]", r"^\s*INFO\b[:\s]"];

const DEFAULT_CRITICAL: &[&str] = &[
    "Error",
    "Traceback",
    "Exception",
    "Failed",
    "Cannot import name",
    "SyntaxError",
    "NameError",
    "AttributeError",
    "TypeError",
    "ValueError",
    "IndexError",
    "KeyError",
    "FileNotFoundError",
    "LabwareLoadError",
    "PipetteMountError",
    "ModuleLoadError",
    "RobotNotSupportedError",
    "ProtocolAnalysisError",
    "opentrons.protocols.types.LocationError",
    "Cannot perform operation: missing tip",
];

const DEFAULT_STDOUT_FAILURE: &[&str] = &[
    "protocol analysis failed",
    "error loading labware",
    "failed to simulate",
];

const DEFAULT_COMPLETION: &[&str] = &[
    "protocol complete",
    "run() finish",
    "done simulating",
    "protocol analysis completed successfully",
];

const DEFAULT_ALWAYS_CRITICAL: &[&str] = &["Traceback"];

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Classification tables (TOML `[patterns]`).
///
/// Phrase tables match case-insensitively as substrings. `log_prefixes` are
/// regular expressions applied per stderr line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatternTables {
    /// Known-benign stderr phrases (calibration files, hardware not connected).
    pub noise: Vec<String>,
    /// Debug/info log prefixes; matching stderr lines are noise.
    pub log_prefixes: Vec<String>,
    /// Phrases that mark a genuine defect when found in cleaned stderr.
    pub critical: Vec<String>,
    /// Stdout sentinels that mark a failed run.
    pub stdout_failure: Vec<String>,
    /// Stdout markers that confirm an explicit successful completion.
    pub completion: Vec<String>,
    /// Raw-stderr markers that fail a run even when the line looks like noise.
    pub always_critical: Vec<String>,
}

impl Default for PatternTables {
    fn default() -> Self {
        Self {
            noise: owned(DEFAULT_NOISE),
            log_prefixes: owned(DEFAULT_LOG_PREFIXES),
            critical: owned(DEFAULT_CRITICAL),
            stdout_failure: owned(DEFAULT_STDOUT_FAILURE),
            completion: owned(DEFAULT_COMPLETION),
            always_critical: owned(DEFAULT_ALWAYS_CRITICAL),
        }
    }
}

impl PatternTables {
    pub fn validate(&self) -> Result<()> {
        if self.critical.iter().all(|p| p.trim().is_empty()) {
            return Err(anyhow!("patterns.critical must contain at least one pattern"));
        }
        if self.noise.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow!("patterns.noise must not contain empty phrases"));
        }
        self.compile().map(|_| ())
    }

    /// Lowercase the phrase tables and compile the prefix regexes.
    pub fn compile(&self) -> Result<CompiledPatterns> {
        let log_prefixes = self
            .log_prefixes
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compile patterns.log_prefixes entry {pattern:?}"))
            })
            .collect::<Result<Vec<Regex>>>()?;

        Ok(CompiledPatterns {
            noise: lowercase_all(&self.noise),
            log_prefixes,
            critical: lowercase_all(&self.critical),
            stdout_failure: lowercase_all(&self.stdout_failure),
            completion: lowercase_all(&self.completion),
            always_critical: self
                .always_critical
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
        })
    }
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items
        .iter()
        .filter(|item| !item.trim().is_empty())
        .map(|item| item.to_lowercase())
        .collect()
}

/// Ready-to-match form of [`PatternTables`].
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub(crate) noise: Vec<String>,
    pub(crate) log_prefixes: Vec<Regex>,
    pub(crate) critical: Vec<String>,
    pub(crate) stdout_failure: Vec<String>,
    pub(crate) completion: Vec<String>,
    /// Matched case-sensitively against raw stderr.
    pub(crate) always_critical: Vec<String>,
}

impl CompiledPatterns {
    /// Compile the built-in tables.
    pub fn defaults() -> Result<Self> {
        PatternTables::default().compile()
    }
}

pub(crate) fn contains_any(haystack_lower: &str, needles_lower: &[String]) -> bool {
    needles_lower
        .iter()
        .any(|needle| haystack_lower.contains(needle.as_str()))
}
