//! Validator executable resolution.
//!
//! The validator is first invoked by name through the `PATH` search. When that
//! fails, a fixed ordered list of fallback directories is searched and the
//! first executable candidate that passes a no-op probe wins.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::budget::CancelToken;
use crate::io::process::run_command_with_timeout;

const PROBE_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
const INTERPRETER_NAMES: &[&str] = &["python3", "python"];

/// The validator could not be located.
#[derive(Debug, Error)]
#[error("{}", not_found_message(program, searched))]
pub struct ExecutableNotFound {
    pub program: String,
    /// Every fallback directory that was searched, in order.
    pub searched: Vec<PathBuf>,
}

fn not_found_message(program: &str, searched: &[PathBuf]) -> String {
    let mut msg = format!(
        "'{program}' command not found in system PATH or the following searched directories:\n"
    );
    if searched.is_empty() {
        msg.push_str("  (none)\n");
    }
    for dir in searched {
        msg.push_str(&format!("  - {}\n", dir.display()));
    }
    msg.push_str(&format!(
        "Ensure the validator is installed and '{program}' is available on PATH or in one of the directories above."
    ));
    msg
}

/// Environment inputs for the fallback search, captured once.
#[derive(Debug, Clone, Default)]
pub struct SearchEnv {
    /// Value used as `PATH` for the by-name probe and interpreter lookup.
    pub path: Option<OsString>,
    /// Active environment roots (`VIRTUAL_ENV`, `CONDA_PREFIX`).
    pub env_roots: Vec<PathBuf>,
    pub home: Option<PathBuf>,
    /// `PYTHONPATH` entries.
    pub python_path: Vec<PathBuf>,
    /// Extra directories from configuration, searched last.
    pub extra_dirs: Vec<PathBuf>,
}

impl SearchEnv {
    pub fn from_env(extra_dirs: &[PathBuf]) -> Self {
        let env_roots = ["VIRTUAL_ENV", "CONDA_PREFIX"]
            .iter()
            .filter_map(std::env::var_os)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .collect();
        let python_path = std::env::var_os("PYTHONPATH")
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();
        Self {
            path: std::env::var_os("PATH"),
            env_roots,
            home: dirs::home_dir(),
            python_path,
            extra_dirs: extra_dirs.to_vec(),
        }
    }

    fn path_dirs(&self) -> Vec<PathBuf> {
        self.path
            .as_ref()
            .map(|value| std::env::split_paths(value).collect())
            .unwrap_or_default()
    }

    /// Ordered fallback directories: interpreter dirs, environment roots,
    /// user-local bins, package-derived bins, configured extras. Only existing
    /// directories are kept, each once.
    pub fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        for name in INTERPRETER_NAMES {
            if let Some(interpreter) = find_in_dirs(&self.path_dirs(), name)
                && let Some(parent) = interpreter.parent()
            {
                dirs.push(parent.to_path_buf());
            }
        }
        for root in &self.env_roots {
            dirs.push(root.join("bin"));
            if cfg!(windows) {
                dirs.push(root.join("Scripts"));
            }
        }
        if cfg!(unix) {
            dirs.push(PathBuf::from("/usr/local/bin"));
        }
        if let Some(home) = &self.home {
            dirs.push(home.join(".local").join("bin"));
        }
        for entry in &self.python_path {
            if !entry.to_string_lossy().contains("site-packages") {
                continue;
            }
            let env_root = entry.join("..").join("..");
            dirs.push(env_root.join("bin"));
            if cfg!(windows) {
                dirs.push(env_root.join("Scripts"));
            }
            dirs.push(entry.join("bin"));
        }
        dirs.extend(self.extra_dirs.iter().cloned());

        dedupe_existing(dirs)
    }
}

fn dedupe_existing(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        let canonical = fs::canonicalize(&dir).unwrap_or(dir);
        if !seen.contains(&canonical) {
            seen.push(canonical);
        }
    }
    seen
}

fn executable_names(program: &str) -> Vec<String> {
    if cfg!(windows) && !program.to_lowercase().ends_with(".exe") {
        vec![program.to_string(), format!("{program}.exe")]
    } else {
        vec![program.to_string()]
    }
}

fn find_in_dirs(dirs: &[PathBuf], program: &str) -> Option<PathBuf> {
    dirs.iter().find_map(|dir| {
        executable_names(program)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|candidate| is_executable(candidate))
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locates the validator executable.
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    program: String,
    probe_arg: String,
    probe_timeout: Duration,
    env: SearchEnv,
}

impl ExecutableResolver {
    pub fn new(program: &str, probe_arg: &str, probe_timeout: Duration, env: SearchEnv) -> Self {
        Self {
            program: program.to_string(),
            probe_arg: probe_arg.to_string(),
            probe_timeout,
            env,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Resolve the validator, probing each candidate with the no-op flag.
    #[instrument(skip_all, fields(program = %self.program))]
    pub fn resolve(&self, cancel: &CancelToken) -> Result<PathBuf, ExecutableNotFound> {
        let mut by_name = Command::new(&self.program);
        if let Some(path) = &self.env.path {
            by_name.env("PATH", path);
        }
        if self.probe(by_name, cancel) {
            let located = find_in_dirs(&self.env.path_dirs(), &self.program)
                .unwrap_or_else(|| PathBuf::from(&self.program));
            info!(path = %located.display(), "validator found on PATH");
            return Ok(located);
        }

        debug!("validator not on PATH, searching fallback directories");
        let searched = self.env.candidate_dirs();
        for dir in &searched {
            let Some(candidate) = find_in_dirs(std::slice::from_ref(dir), &self.program) else {
                continue;
            };
            if self.probe(Command::new(&candidate), cancel) {
                info!(path = %candidate.display(), "validator found in fallback directory");
                return Ok(candidate);
            }
            debug!(path = %candidate.display(), "candidate failed probe");
        }

        Err(ExecutableNotFound {
            program: self.program.clone(),
            searched,
        })
    }

    fn probe(&self, mut cmd: Command, cancel: &CancelToken) -> bool {
        cmd.arg(&self.probe_arg);
        match run_command_with_timeout(
            cmd,
            None,
            self.probe_timeout,
            PROBE_OUTPUT_LIMIT_BYTES,
            cancel,
        ) {
            Ok(output) => output.success(),
            Err(err) => {
                debug!(err = %err, "probe failed to run");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_dirs_keep_order_and_drop_missing_and_duplicates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let venv = temp.path().join("venv");
        let extra = temp.path().join("extra");
        fs::create_dir_all(venv.join("bin")).expect("venv bin");
        fs::create_dir_all(&extra).expect("extra");

        let env = SearchEnv {
            path: None,
            env_roots: vec![venv.clone(), temp.path().join("missing-root")],
            home: None,
            python_path: Vec::new(),
            extra_dirs: vec![extra.clone(), venv.join("bin")],
        };

        let dirs = env.candidate_dirs();
        let venv_bin = fs::canonicalize(venv.join("bin")).expect("canonical venv");
        let extra = fs::canonicalize(extra).expect("canonical extra");
        let venv_pos = dirs.iter().position(|d| *d == venv_bin).expect("venv bin listed");
        let extra_pos = dirs.iter().position(|d| *d == extra).expect("extra listed");
        assert!(venv_pos < extra_pos);
        assert_eq!(dirs.iter().filter(|d| **d == venv_bin).count(), 1);
    }

    #[test]
    fn site_packages_entries_derive_bin_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let site = temp.path().join("env/lib/python3.12/site-packages");
        fs::create_dir_all(&site).expect("site-packages");
        fs::create_dir_all(temp.path().join("env/lib/bin")).expect("derived bin");

        let env = SearchEnv {
            python_path: vec![site],
            ..SearchEnv::default()
        };
        let expected = fs::canonicalize(temp.path().join("env/lib/bin")).expect("canonical");
        assert!(env.candidate_dirs().contains(&expected));
    }

    #[test]
    fn not_found_lists_searched_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = SearchEnv {
            path: Some(OsString::new()),
            extra_dirs: vec![temp.path().to_path_buf()],
            ..SearchEnv::default()
        };
        let resolver = ExecutableResolver::new(
            "labscript-test-no-such-validator",
            "--version",
            Duration::from_secs(5),
            env,
        );

        let err = resolver.resolve(&CancelToken::new()).unwrap_err();
        let canonical = fs::canonicalize(temp.path()).expect("canonical");
        assert!(err.searched.contains(&canonical));
        let msg = err.to_string();
        assert!(msg.contains("labscript-test-no-such-validator"));
        assert!(msg.contains(&canonical.display().to_string()));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn fallback_directory_candidate_is_probed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let broken = temp.path().join("broken");
        let working = temp.path().join("working");
        fs::create_dir_all(&broken).expect("broken dir");
        fs::create_dir_all(&working).expect("working dir");
        write_script(&broken, "labscript-test-validator", "exit 1");
        let good = write_script(&working, "labscript-test-validator", "exit 0");

        let env = SearchEnv {
            path: Some(OsString::new()),
            extra_dirs: vec![broken, working],
            ..SearchEnv::default()
        };
        let resolver = ExecutableResolver::new(
            "labscript-test-validator",
            "--version",
            Duration::from_secs(5),
            env,
        );

        let resolved = resolver.resolve(&CancelToken::new()).expect("resolve");
        assert_eq!(
            fs::canonicalize(resolved).expect("canonical resolved"),
            fs::canonicalize(good).expect("canonical good")
        );
    }

    #[cfg(unix)]
    #[test]
    fn path_lookup_wins_over_fallbacks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let on_path = write_script(temp.path(), "labscript-test-on-path", "exit 0");

        let env = SearchEnv {
            path: Some(temp.path().as_os_str().to_owned()),
            ..SearchEnv::default()
        };
        let resolver = ExecutableResolver::new(
            "labscript-test-on-path",
            "--version",
            Duration::from_secs(5),
            env,
        );

        assert_eq!(resolver.resolve(&CancelToken::new()).expect("resolve"), on_path);
    }
}
