//! The `Checker` seam: run one declared check, get an exit status and
//! structured output back.
//!
//! `ProcessChecker` runs the check's command as a child process with a hard
//! timeout. A check that overruns is killed, never left running.

use crate::core::config::CheckDef;
use crate::core::error::PhasegateError;
use crate::core::scope::{ChangeScope, ScopeMode};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// `name = 12` or `name: 12.5` on a line of its own.
static MEASUREMENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*$")
        .expect("valid measurement regex")
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckOutput {
    pub exit_code: i32,
    pub diagnostics: String,
    pub measurements: BTreeMap<String, f64>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CheckOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

pub trait Checker: Send + Sync {
    /// Run `check` against `scope`. `Err` means the check could not be
    /// executed at all (tool missing, spawn failure).
    fn run(
        &self,
        check: &CheckDef,
        scope: &ChangeScope,
        timeout: Duration,
    ) -> Result<CheckOutput, PhasegateError>;

    /// Whether the tool behind `check` can be invoked.
    fn available(&self, check: &CheckDef) -> bool {
        let _ = check;
        true
    }
}

/// Extract `name = number` lines from tool output.
pub fn parse_measurements(stdout: &str) -> BTreeMap<String, f64> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = MEASUREMENT_LINE.captures(line)?;
            let value = caps[2].parse::<f64>().ok()?;
            Some((caps[1].to_string(), value))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ProcessChecker {
    working_dir: PathBuf,
}

impl ProcessChecker {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }

    fn build_command(&self, check: &CheckDef, scope: &ChangeScope) -> Command {
        let mut cmd = Command::new(&check.command);
        cmd.args(&check.args);
        if check.pass_files && scope.mode == ScopeMode::Incremental {
            cmd.args(&scope.changed_files);
        }
        let mode = match scope.mode {
            ScopeMode::Full => "full",
            ScopeMode::Incremental => "incremental",
        };
        cmd.env("PHASEGATE_SCOPE_MODE", mode)
            .env("PHASEGATE_CHANGED_FILES", scope.changed_files.join("\n"))
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can take down everything the tool started.
            cmd.process_group(0);
        }
        cmd
    }
}

/// Kill the check and every process in its group, then reap it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id())
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            tracing::debug!(pid, error = %e, "process group already gone");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl Checker for ProcessChecker {
    fn run(
        &self,
        check: &CheckDef,
        scope: &ChangeScope,
        timeout: Duration,
    ) -> Result<CheckOutput, PhasegateError> {
        let start = Instant::now();
        let mut child = self.build_command(check, scope).spawn().map_err(|e| {
            PhasegateError::ValidationError(format!(
                "check '{}' could not start '{}': {}",
                check.name, check.command, e
            ))
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None if start.elapsed() >= timeout => {
                    terminate(&mut child);
                    break None;
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let Some(status) = status else {
            tracing::warn!(check = %check.name, timeout_secs = timeout.as_secs(), "check timed out and was killed");
            // Descendants that escaped the group may still hold the pipes; do not
            // wait on the readers.
            return Ok(CheckOutput {
                exit_code: -1,
                diagnostics: format!("timed out after {}s", timeout.as_secs()),
                measurements: BTreeMap::new(),
                timed_out: true,
                duration_ms,
            });
        };

        let stdout = String::from_utf8_lossy(&stdout.join().unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr.join().unwrap_or_default()).to_string();
        let measurements = parse_measurements(&stdout);
        let diagnostics = if stderr.trim().is_empty() {
            stdout
        } else {
            format!("{}\n{}", stdout, stderr)
        };

        Ok(CheckOutput {
            exit_code: status.code().unwrap_or(-1),
            diagnostics,
            measurements,
            timed_out: false,
            duration_ms,
        })
    }

    fn available(&self, check: &CheckDef) -> bool {
        let command = Path::new(&check.command);
        if command.components().count() > 1 {
            let resolved = if command.is_absolute() {
                command.to_path_buf()
            } else {
                self.working_dir.join(command)
            };
            return resolved.is_file();
        }
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| dir.join(&check.command).is_file())
    }
}
