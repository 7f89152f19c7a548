//! Generation invoker: turn a working prompt into a candidate script.
//!
//! The loop only sees the [`Generator`] trait. [`CommandGenerator`] renders the
//! prompt and pipes it to an external command that talks to the model; the
//! reply on stdout is reduced to the script it contains.

use std::fs;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::CancelToken;
use crate::core::code_block::extract_code;
use crate::core::truncate::head;
use crate::io::config::GeneratorConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{PromptEngine, PromptInputs};

/// Characters of generator stderr kept in error messages.
const STDERR_EXCERPT_CHARS: usize = 1000;

/// One generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub hardware_context: &'a str,
    pub working_prompt: &'a str,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A generation call that produced no usable script.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to start generator command `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("generator timed out after {secs} seconds")]
    Timeout { secs: u64 },
    #[error("generator was cancelled")]
    Cancelled,
    #[error("generator exited with code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("generator returned no code")]
    EmptyResponse,
    #[error("failed to build generation prompt: {0}")]
    Prompt(String),
}

/// Abstraction over code generation backends.
pub trait Generator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError>;
}

impl<F> Generator for F
where
    F: Fn(&GenerationRequest<'_>) -> Result<String, GenerationError>,
{
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        self(request)
    }
}

/// Generator that pipes the rendered prompt to an external command.
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    reference: Option<String>,
    engine: PromptEngine,
    cancel: CancelToken,
}

impl CommandGenerator {
    pub fn from_config(cfg: &GeneratorConfig, cancel: CancelToken) -> anyhow::Result<Self> {
        let reference = match &cfg.reference_path {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("read reference {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self {
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            reference,
            engine: PromptEngine::new()?,
            cancel,
        })
    }

    fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(attempt = request.attempt, command = %self.command_line()))]
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let prompt = self
            .engine
            .render(&PromptInputs {
                hardware_context: request.hardware_context,
                working_prompt: request.working_prompt,
                reference: self.reference.as_deref(),
                attempt: request.attempt,
            })
            .map_err(|err| GenerationError::Prompt(format!("{err:#}")))?;
        debug!(prompt_len = prompt.len(), "prompt rendered");

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| GenerationError::Prompt("generator command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.cancel.clamp(self.timeout),
            self.output_limit_bytes,
            &self.cancel,
        )
        .map_err(|err| GenerationError::Spawn {
            command: self.command_line(),
            reason: format!("{err:#}"),
        })?;

        if output.cancelled || (output.timed_out && self.cancel.is_cancelled()) {
            return Err(GenerationError::Cancelled);
        }
        if output.timed_out {
            return Err(GenerationError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }
        if !output.success() {
            let stderr = head(output.stderr_lossy().trim(), STDERR_EXCERPT_CHARS);
            warn!(exit_code = ?output.status.and_then(|s| s.code()), "generator command failed");
            return Err(GenerationError::Failed {
                exit_code: output.status.and_then(|s| s.code()),
                stderr,
            });
        }

        let code = extract_code(&output.stdout_lossy());
        if code.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        info!(code_len = code.len(), "generator returned code");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest<'static> {
        GenerationRequest {
            hardware_context: "p300 left",
            working_prompt: "transfer water",
            attempt: 1,
        }
    }

    #[test]
    fn closures_are_generators() {
        let generator = |req: &GenerationRequest<'_>| -> Result<String, GenerationError> {
            Ok(format!("# {}", req.working_prompt))
        };
        assert_eq!(
            generator.generate(&request()).expect("generate"),
            "# transfer water"
        );
    }

    #[test]
    fn missing_reference_file_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = GeneratorConfig {
            reference_path: Some(temp.path().join("missing.md")),
            ..GeneratorConfig::default()
        };
        assert!(CommandGenerator::from_config(&cfg, CancelToken::new()).is_err());
    }

    #[test]
    fn unknown_command_is_a_spawn_error() {
        let cfg = GeneratorConfig {
            command: vec!["labscript-test-no-such-generator".to_string()],
            ..GeneratorConfig::default()
        };
        let generator = CommandGenerator::from_config(&cfg, CancelToken::new()).expect("generator");
        let err = generator.generate(&request()).unwrap_err();
        assert!(matches!(err, GenerationError::Spawn { .. }), "{err:?}");
    }

    #[cfg(unix)]
    fn sh_generator(script: &str) -> CommandGenerator {
        let cfg = GeneratorConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 10,
            ..GeneratorConfig::default()
        };
        CommandGenerator::from_config(&cfg, CancelToken::new()).expect("generator")
    }

    #[cfg(unix)]
    #[test]
    fn fenced_reply_is_extracted() {
        let generator = sh_generator(
            "cat >/dev/null; printf 'Here it is\\n```python\\nfrom opentrons import protocol_api\\n```\\n'",
        );
        assert_eq!(
            generator.generate(&request()).expect("generate"),
            "from opentrons import protocol_api"
        );
    }

    #[cfg(unix)]
    #[test]
    fn prompt_reaches_the_command() {
        let generator = sh_generator("grep -q 'transfer water' && echo 'import json'");
        assert_eq!(generator.generate(&request()).expect("generate"), "import json");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_and_empty_reply_are_errors() {
        let err = sh_generator("cat >/dev/null; echo 'quota exceeded' >&2; exit 4")
            .generate(&request())
            .unwrap_err();
        match err {
            GenerationError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(stderr, "quota exceeded");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = sh_generator("cat >/dev/null")
            .generate(&request())
            .unwrap_err();
        assert!(matches!(err, GenerationError::EmptyResponse));
    }
}
