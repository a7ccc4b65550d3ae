//! Timeout-bounded subprocess execution, shared by the agent invoker (§4.6) and by
//! backpressure/baseline-check command execution (§4.2, §4.7).
//!
//! Polls `try_wait()` against a deadline and kills on timeout, with two additions
//! the agent-invocation domain needs: writing a prompt to the child's stdin before
//! closing it, and a two-stage SIGTERM-then-SIGKILL cancellation so an agent process
//! gets a chance to flush its own state before it is killed outright.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Result of a command execution with timeout bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (or -1 when not available, e.g. killed by signal or timed out).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn ok(&self) -> Result<&Self> {
        if self.success() {
            Ok(self)
        } else if self.timed_out {
            Err(anyhow::anyhow!("command timed out after {:?}", self.duration))
        } else {
            Err(anyhow::anyhow!("command failed with exit code {}: {}", self.exit_code, self.stderr))
        }
    }
}

/// How long a graceful-shutdown signal is given to take effect before escalating to
/// an unconditional kill.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Run a command, optionally bounded by a wall-clock timeout and optionally fed a
/// prompt on stdin before the pipe is closed. A `None` timeout runs to completion.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &std::path::Path,
    timeout: Option<Duration>,
    stdin_prompt: Option<&str>,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir).stdout(Stdio::piped()).stderr(Stdio::piped());
    if stdin_prompt.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command.spawn().with_context(|| format!("failed to spawn command: {program}"))?;

    if let Some(prompt) = stdin_prompt {
        let mut stdin = child.stdin.take().context("child stdin was not piped")?;
        stdin.write_all(prompt.as_bytes()).context("failed to write prompt to child stdin")?;
        // Drop to close the pipe so the child sees EOF.
    }

    let Some(timeout_dur) = timeout else {
        let output = child.wait_with_output().with_context(|| format!("failed to wait on command: {program}"))?;
        return Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child.try_wait().with_context(|| format!("failed to poll command: {program}"))? {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    terminate_then_kill(&mut child, DEFAULT_TERMINATION_GRACE);
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!("\n{program} timed out after {}", humantime::format_duration(timeout_dur)));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Send SIGTERM, wait up to `grace` for the child to exit on its own, then SIGKILL.
/// On non-unix targets there is no graceful-signal equivalent, so this kills
/// immediately.
pub fn terminate_then_kill(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        if kill(pid, Signal::SIGTERM).is_ok() {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                    Err(_) => break,
                }
            }
        }
    }
    let _ = child.kill();
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Run a command and capture output, no timeout, no stdin. Used for quick
/// one-shot baseline checks that are not expected to hang.
pub fn run_command(program: &str, args: &[&str], working_dir: &std::path::Path) -> Result<CommandOutput> {
    run_with_timeout(program, args, working_dir, None, None)
}

pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn run_command_captures_success() {
        let result = run_command("sh", &["-c", "echo hello"], Path::new(".")).unwrap();
        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }

    #[test]
    fn run_command_captures_nonzero_exit() {
        let result = run_command("sh", &["-c", "exit 3"], Path::new(".")).unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn run_with_timeout_writes_prompt_to_stdin() {
        let result = run_with_timeout("cat", &[], Path::new("."), Some(Duration::from_secs(5)), Some("ping")).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "ping");
    }

    #[test]
    fn run_with_timeout_kills_on_deadline() {
        let result = run_with_timeout("sh", &["-c", "sleep 5"], Path::new("."), Some(Duration::from_millis(200)), None).unwrap();
        assert!(result.timed_out);
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    fn run_with_timeout_none_runs_to_completion() {
        let result = run_with_timeout("sh", &["-c", "echo done"], Path::new("."), None, None).unwrap();
        assert!(!result.timed_out);
        assert!(result.stdout.contains("done"));
    }

    #[test]
    fn command_exists_true_for_sh() {
        assert!(command_exists("sh"));
    }

    #[test]
    fn command_exists_false_for_bogus_binary() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }

    #[test]
    fn command_output_ok_surfaces_timeout_distinctly() {
        let out = CommandOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: "timed out".into(),
            timed_out: true,
            duration: Duration::from_secs(1),
        };
        let err = out.ok().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
