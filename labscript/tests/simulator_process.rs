//! Process-level tests for the simulation harness.
//!
//! Each test writes a small shell script that stands in for the validator and
//! points the harness at it through an isolated search environment.
#![cfg(unix)]

use std::fs;
use std::time::{Duration, Instant};

use labscript::core::budget::CancelToken;
use labscript::core::feedback::extract_feedback;
use labscript::core::types::StatusLabel;
use labscript::io::simulator::{HARNESS_FAILURE_CODE, ProcessSimulator, Simulator};
use labscript::test_support::{isolated_validator_env, write_fake_validator};

const PROGRAM: &str = "labscript-fake-simulate";

fn harness(body: &str) -> (tempfile::TempDir, tempfile::TempDir, ProcessSimulator) {
    let bin = tempfile::tempdir().expect("bin dir");
    let scratch = tempfile::tempdir().expect("scratch dir");
    write_fake_validator(bin.path(), PROGRAM, body);
    let (cfg, env) = isolated_validator_env(bin.path(), PROGRAM);
    let simulator = ProcessSimulator::with_search_env(&cfg, env)
        .expect("simulator")
        .with_temp_dir(scratch.path());
    (bin, scratch, simulator)
}

#[test]
fn completed_run_is_succeeded() {
    let (_bin, _scratch, simulator) = harness("echo 'Protocol complete'");
    let result = simulator
        .run("from opentrons import protocol_api", &CancelToken::new())
        .expect("run");

    assert_eq!(result.return_code, 0);
    assert!(result.success);
    assert_eq!(result.status_label, StatusLabel::Succeeded);
    assert_eq!(result.stdout, "Protocol complete");
    assert!(result.command.as_deref().is_some_and(|c| c.ends_with(PROGRAM)));
}

#[test]
fn validator_receives_the_script_and_log_level() {
    let (_bin, _scratch, simulator) = harness("cat \"$1\"; echo \"$2 $3\"");
    let result = simulator
        .run("metadata = {'apiLevel': '2.20'}", &CancelToken::new())
        .expect("run");

    assert!(result.stdout.contains("metadata = {'apiLevel': '2.20'}"));
    assert!(result.stdout.ends_with("--log-level DEBUG"));
}

#[test]
fn child_runs_with_utf8_python_settings() {
    let (_bin, _scratch, simulator) = harness("echo \"$PYTHONIOENCODING $PYTHONUTF8\"");
    let result = simulator.run("pass", &CancelToken::new()).expect("run");
    assert_eq!(result.stdout, "utf-8 1");
}

#[test]
fn traceback_fails_and_feeds_back_the_error() {
    let (_bin, _scratch, simulator) = harness(
        "echo 'Traceback (most recent call last):' >&2\necho \"  File \\\"$1\\\", line 4, in run\" >&2\necho \"NameError: name 'foo' is not defined\" >&2\nexit 1",
    );
    let result = simulator.run("foo()", &CancelToken::new()).expect("run");

    assert_eq!(result.return_code, 1);
    assert!(!result.success);
    assert_eq!(result.status_label, StatusLabel::Failed);
    let feedback = extract_feedback(&result.output_text());
    assert!(feedback.contains("NameError"), "{feedback}");
    assert!(result.transcript.contains("--- Protocol Code ---\nfoo()"));
}

#[test]
fn noise_only_stderr_still_succeeds() {
    let (_bin, _scratch, simulator) = harness(
        "echo 'Calibration data not found' >&2\necho 'Defaulting to global settings' >&2\nexit 0",
    );
    let result = simulator.run("pass", &CancelToken::new()).expect("run");

    assert!(result.success);
    assert_eq!(result.cleaned_stderr, "");
    assert!(matches!(
        result.status_label,
        StatusLabel::Succeeded | StatusLabel::LikelySucceeded
    ));
}

#[test]
fn timeout_kills_the_validator_and_removes_the_script() {
    let bin = tempfile::tempdir().expect("bin dir");
    let scratch = tempfile::tempdir().expect("scratch dir");
    write_fake_validator(bin.path(), PROGRAM, "exec sleep 30");
    let (mut cfg, env) = isolated_validator_env(bin.path(), PROGRAM);
    cfg.simulator.timeout_secs = 1;
    let simulator = ProcessSimulator::with_search_env(&cfg, env)
        .expect("simulator")
        .with_temp_dir(scratch.path());

    let started = Instant::now();
    let result = simulator.run("pass", &CancelToken::new()).expect("run");

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(result.return_code, HARNESS_FAILURE_CODE);
    assert!(!result.success);
    assert!(result.stderr.contains("timed out"), "{}", result.stderr);
    let leftovers: Vec<_> = fs::read_dir(scratch.path())
        .expect("read scratch")
        .collect();
    assert!(leftovers.is_empty(), "temp script left behind: {leftovers:?}");
}

#[test]
fn timeout_is_enforced_when_the_validator_forks_a_child() {
    let bin = tempfile::tempdir().expect("bin dir");
    let scratch = tempfile::tempdir().expect("scratch dir");
    write_fake_validator(bin.path(), PROGRAM, "sleep 20\necho done");
    let (mut cfg, env) = isolated_validator_env(bin.path(), PROGRAM);
    cfg.simulator.timeout_secs = 1;
    let simulator = ProcessSimulator::with_search_env(&cfg, env)
        .expect("simulator")
        .with_temp_dir(scratch.path());
    simulator.resolve(&CancelToken::new()).expect("resolve");

    let started = Instant::now();
    let result = simulator.run("pass", &CancelToken::new()).expect("run");

    assert!(
        started.elapsed() < Duration::from_secs(10),
        "returned after {:?}",
        started.elapsed()
    );
    assert_eq!(result.return_code, HARNESS_FAILURE_CODE);
    assert!(result.stderr.contains("timed out"), "{}", result.stderr);
    assert!(!result.stdout.contains("done"));
}

#[test]
fn script_file_is_removed_after_a_normal_run() {
    let (_bin, scratch, simulator) = harness("test -f \"$1\" && echo present");
    let result = simulator.run("pass", &CancelToken::new()).expect("run");

    assert_eq!(result.stdout, "present");
    let leftovers = fs::read_dir(scratch.path()).expect("read scratch").count();
    assert_eq!(leftovers, 0);
}

#[test]
fn cancelled_token_returns_a_failed_result() {
    let (_bin, _scratch, simulator) = harness("exec sleep 30");
    let cancel = CancelToken::new();
    // Resolve first so the probe is not the step that observes cancellation.
    simulator.resolve(&cancel).expect("resolve");
    cancel.cancel();

    let started = Instant::now();
    let result = simulator.run("pass", &cancel).expect("run");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.return_code, HARNESS_FAILURE_CODE);
    assert!(result.stderr.contains("cancelled"));
}

#[test]
fn long_output_is_truncated_to_the_transcript_limit() {
    let (_bin, _scratch, simulator) = harness("i=0\nwhile [ $i -lt 800 ]; do echo \"line $i\"; i=$((i+1)); done");
    let result = simulator.run("pass", &CancelToken::new()).expect("run");

    assert_eq!(result.transcript.chars().count(), 5000);
    assert!(result.transcript.starts_with("Command: "));
    assert!(result.transcript.contains("[Simulation output truncated for brevity]"));
    assert!(result.transcript.ends_with("(Simulation likely succeeded (no explicit completion message))"));
    assert!(result.stdout.ends_with("line 799"));
}
