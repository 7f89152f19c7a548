//! Command-line front end for protocol generation and validation.
//!
//! `generate` runs the full retry loop against the configured generator
//! command and validator; `simulate` and `resolve` exercise the validator
//! alone. Settings come from `labscript.toml` (see `labscript init`).

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use labscript::controller::{ControllerConfig, Pipeline, Session, run_session};
use labscript::core::budget::CancelToken;
use labscript::exit_codes;
use labscript::io::config::{DEFAULT_CONFIG_FILE, LabscriptConfig, load_config, write_config};
use labscript::io::generator::CommandGenerator;
use labscript::io::reporter::{Fanout, JsonlSink, ProgressSink, TracingSink};
use labscript::io::simulator::{ProcessSimulator, Simulator};
use labscript::logging;

#[derive(Parser)]
#[command(
    name = "labscript",
    version,
    about = "Generate lab-automation protocols and validate them in the simulator"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Generate a protocol, retrying with simulator feedback until it passes.
    Generate {
        /// Goal or SOP text.
        #[arg(long, conflicts_with = "goal_file", required_unless_present = "goal_file")]
        goal: Option<String>,
        /// Read the goal or SOP from a file.
        #[arg(long)]
        goal_file: Option<PathBuf>,
        /// Hardware configuration text.
        #[arg(long, conflicts_with = "hardware_file")]
        hardware: Option<String>,
        /// Read the hardware configuration from a file.
        #[arg(long)]
        hardware_file: Option<PathBuf>,
        /// Attempt budget; defaults to `max_attempts` from the config.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Write the final script here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Append iteration events as JSON lines to this file.
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Run the validator once against a script and print the transcript.
    Simulate {
        /// Protocol script to validate.
        script: PathBuf,
    },
    /// Print the resolved validator executable.
    Resolve,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Generate {
            goal,
            goal_file,
            hardware,
            hardware_file,
            max_attempts,
            output,
            events,
        } => {
            let goal = text_or_file(goal, goal_file.as_deref(), "goal")?
                .context("either --goal or --goal-file is required")?;
            let hardware =
                text_or_file(hardware, hardware_file.as_deref(), "hardware")?.unwrap_or_default();
            let cfg = load_config(&cli.config)?;
            cmd_generate(
                &cfg,
                &goal,
                &hardware,
                max_attempts,
                output.as_deref(),
                events.as_deref(),
            )
        }
        Command::Simulate { script } => {
            let cfg = load_config(&cli.config)?;
            cmd_simulate(&cfg, &script)
        }
        Command::Resolve => {
            let cfg = load_config(&cli.config)?;
            cmd_resolve(&cfg)
        }
    }
}

fn text_or_file(text: Option<String>, file: Option<&Path>, what: &str) -> Result<Option<String>> {
    match (text, file) {
        (Some(text), _) => Ok(Some(text)),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("read {what} file {}", path.display()))
            .map(Some),
        (None, None) => Ok(None),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &LabscriptConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_generate(
    cfg: &LabscriptConfig,
    goal: &str,
    hardware: &str,
    max_attempts: Option<u32>,
    output: Option<&Path>,
    events: Option<&Path>,
) -> Result<i32> {
    let max_attempts = max_attempts.unwrap_or(cfg.max_attempts);
    let session = Session::new(goal, hardware, max_attempts)?;

    let cancel = CancelToken::new();
    let simulator = ProcessSimulator::from_config(cfg)?;
    let generator = CommandGenerator::from_config(&cfg.generator, cancel.clone())?;
    let controller_cfg = ControllerConfig::from_config(cfg);
    let pipeline = Pipeline {
        generator: &generator,
        simulator: &simulator,
        config: &controller_cfg,
        cancel: &cancel,
    };

    let report = match events {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open events file {}", path.display()))?;
            let mut sink = Fanout(
                Fanout(TracingSink, ProgressSink::new(io::stderr())),
                JsonlSink::new(BufWriter::new(file)),
            );
            run_session(session, &pipeline, &mut sink)
        }
        None => {
            let mut sink = Fanout(TracingSink, ProgressSink::new(io::stderr()));
            run_session(session, &pipeline, &mut sink)
        }
    };

    match report.code() {
        Some(code) => {
            match output {
                Some(path) => {
                    let mut contents = code.to_string();
                    contents.push('\n');
                    fs::write(path, contents)
                        .with_context(|| format!("write {}", path.display()))?;
                    eprintln!(
                        "protocol passed simulation after {} attempt(s); wrote {}",
                        report.attempts_used(),
                        path.display()
                    );
                }
                None => println!("{code}"),
            }
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("{}", report.render());
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_simulate(cfg: &LabscriptConfig, script_path: &Path) -> Result<i32> {
    let script = fs::read_to_string(script_path)
        .with_context(|| format!("read script {}", script_path.display()))?;
    let simulator = ProcessSimulator::from_config(cfg)?;
    let result = simulator.run(&script, &CancelToken::new())?;
    println!("{}", result.transcript);
    if result.success {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::FAILED)
    }
}

fn cmd_resolve(cfg: &LabscriptConfig) -> Result<i32> {
    let simulator = ProcessSimulator::from_config(cfg)?;
    match simulator.resolve(&CancelToken::new()) {
        Ok(path) => {
            println!("{}", path.display());
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::INVALID)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["labscript", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_generate_with_goal_file() {
        let cli = Cli::parse_from([
            "labscript",
            "--config",
            "custom.toml",
            "generate",
            "--goal-file",
            "sop.md",
            "--max-attempts",
            "5",
        ]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Command::Generate {
                goal,
                goal_file,
                max_attempts,
                ..
            } => {
                assert!(goal.is_none());
                assert_eq!(goal_file, Some(PathBuf::from("sop.md")));
                assert_eq!(max_attempts, Some(5));
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn generate_requires_a_goal_source() {
        assert!(Cli::try_parse_from(["labscript", "generate"]).is_err());
        assert!(
            Cli::try_parse_from(["labscript", "generate", "--goal", "a", "--goal-file", "b"])
                .is_err()
        );
    }

    #[test]
    fn inline_text_wins_over_missing_file() {
        let text = text_or_file(Some("inline".to_string()), None, "goal").expect("text");
        assert_eq!(text.as_deref(), Some("inline"));
        assert!(text_or_file(None, Some(Path::new("/no/such/file")), "goal").is_err());
    }
}
