//! Subprocess plumbing for command-line VCS backends
//!
//! Subversion, Mercurial and TFS have no usable in-process library, so their
//! workspaces and extractors shell out to the native client. This module owns
//! the one way we run those clients: spawn, drain both pipes off-thread,
//! poll for completion, kill on deadline.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Process-wide kill switch, set by the scheduler when a run is cancelled.
/// Cooperative checks between pipeline steps stop new work; this flag stops
/// subprocesses already in flight, which would otherwise outlive the run.
static CANCELLED: AtomicBool = AtomicBool::new(false);

pub fn request_cancellation() {
    CANCELLED.store(true, Ordering::SeqCst);
}

pub fn clear_cancellation() {
    CANCELLED.store(false, Ordering::SeqCst);
}

pub fn cancellation_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// Errors from running an external VCS client.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{tool} not found on PATH; install it first")]
    NotFound { tool: String },

    #[error("{tool} timed out after {seconds}s")]
    TimedOut { tool: String, seconds: u64 },

    #[error("{tool} interrupted by cancellation")]
    Cancelled { tool: String },

    #[error("{tool} exited with code {code}: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to run {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a completed tool run.
///
/// stdout stays raw bytes because some callers read file content through it
/// (`svn cat`, `hg cat`); stderr is diagnostics and is lossily decoded.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub return_code: Option<i32>,
}

impl ToolOutput {
    pub fn stdout_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Exit-code check that turns a non-zero exit into a typed error
    /// carrying the tool's stderr.
    pub fn require_success(self, tool: &str) -> Result<Self, ProcessError> {
        match self.return_code {
            Some(0) => Ok(self),
            code => Err(ProcessError::Failed {
                tool: tool.to_string(),
                code: code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            }),
        }
    }
}

/// Run a VCS client to completion.
///
/// # Arguments
/// * `tool` - Program name, resolved through PATH
/// * `args` - Arguments passed verbatim
/// * `cwd` - Working directory, usually the workspace root
/// * `envs` - Extra environment variables (e.g. `HGPLAIN=1`, `LC_ALL=C`)
/// * `timeout_secs` - Kill deadline in seconds, 0 for no deadline
pub fn run_tool<I, S>(
    tool: &str,
    args: I,
    cwd: Option<&Path>,
    envs: &[(&str, &str)],
    timeout_secs: u64,
) -> Result<ToolOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(tool);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    debug!(tool, timeout_secs, "running external client");

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound {
                tool: tool.to_string(),
            }
        } else {
            ProcessError::Io {
                tool: tool.to_string(),
                source: e,
            }
        }
    })?;

    // Drain both pipes off-thread so a chatty client cannot fill the pipe
    // buffer and wedge before we observe its exit.
    let stdout_thread = child.stdout.take().map(spawn_reader);
    let stderr_thread = child.stderr.take().map(spawn_reader);

    let start = Instant::now();
    let deadline = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if cancellation_requested() {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!(tool, "external client killed on cancellation");
                    return Err(ProcessError::Cancelled {
                        tool: tool.to_string(),
                    });
                }
                if let Some(limit) = deadline {
                    if start.elapsed() > limit {
                        let _ = child.kill();
                        let _ = child.wait();
                        warn!(tool, timeout_secs, "external client timed out, killed");
                        return Err(ProcessError::TimedOut {
                            tool: tool.to_string(),
                            seconds: timeout_secs,
                        });
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(ProcessError::Io {
                    tool: tool.to_string(),
                    source: e,
                })
            }
        }
    };

    let stdout = stdout_thread
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr = stderr_thread
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();

    Ok(ToolOutput {
        stdout,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        return_code: status.code(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Serializes tests that exercise the process-global cancellation flag with
/// tests whose child processes must not be killed under it.
#[cfg(test)]
pub(crate) fn cancel_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

/// Probe for a client on PATH by asking it for its version.
pub fn is_tool_installed(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout_and_exit_code() {
        let output = run_tool("sh", ["-c", "printf hello"], None, &[], 10).unwrap();
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(output.return_code, Some(0));
        let output = output.require_success("sh").unwrap();
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn test_nonzero_exit_becomes_error() {
        let output = run_tool("sh", ["-c", "echo oops >&2; exit 3"], None, &[], 10).unwrap();
        assert_eq!(output.return_code, Some(3));
        match output.require_success("sh") {
            Err(ProcessError::Failed { code, stderr, .. }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_tool() {
        let err = run_tool("definitely-not-a-real-vcs-client", ["--version"], None, &[], 10)
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }

    #[test]
    fn test_env_passthrough() {
        let output = run_tool(
            "sh",
            ["-c", "printf '%s' \"$HGPLAIN\""],
            None,
            &[("HGPLAIN", "1")],
            10,
        )
        .unwrap();
        assert_eq!(output.stdout_text(), "1");
    }

    #[test]
    fn test_deadline_kills_child() {
        let _serial = cancel_guard();
        clear_cancellation();
        let start = Instant::now();
        let err = run_tool("sh", ["-c", "sleep 10"], None, &[], 1).unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { seconds: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancellation_kills_child() {
        let _serial = cancel_guard();
        clear_cancellation();
        let trigger = thread::spawn(|| {
            thread::sleep(Duration::from_millis(200));
            request_cancellation();
        });
        let start = Instant::now();
        let err = run_tool("sh", ["-c", "sleep 10"], None, &[], 30).unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        trigger.join().unwrap();
        clear_cancellation();
    }
}
