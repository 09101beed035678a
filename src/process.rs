//! Supervised child processes.
//!
//! Every external command (host steps, `docker`, `diff`) goes through
//! [`run_supervised`]: stdout and stderr are read on their own threads,
//! captured, and optionally streamed line by line into a [`TaskLog`]. The
//! calling thread polls the child and terminates it when the deadline
//! expires or the cancel token fires.
//!
//! Termination sends SIGTERM to the child's process group, waits for a
//! grace period, then sends SIGKILL. When the leader exits on its own, any
//! process it left behind in its group is killed before the output is
//! collected, so background children cannot hold the pipes open.

use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::log::TaskLog;
use crate::signal::CancelToken;
use crate::timeout::Deadline;

/// Interval between child status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("`{program}` was cancelled")]
    Cancelled { program: String },
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Output exactly as the process wrote it.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RawOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

impl From<RawOutput> for ProcessOutput {
    fn from(raw: RawOutput) -> Self {
        Self {
            status: raw.status,
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        }
    }
}

/// What to watch while a process runs.
#[derive(Default, Clone, Copy)]
pub struct Supervision<'a> {
    pub deadline: Option<&'a Deadline>,
    pub cancel: Option<&'a CancelToken>,
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Run a command to completion under supervision.
///
/// A non-zero exit is not an error here; callers inspect
/// [`ProcessOutput::status`]. Output is decoded lossily.
pub fn run_supervised(
    command: &mut Command,
    supervision: Supervision<'_>,
    log: Option<Arc<TaskLog>>,
) -> ProcessResult<ProcessOutput> {
    run_supervised_raw(command, supervision, log).map(ProcessOutput::from)
}

/// Like [`run_supervised`], but hands back the captured bytes untouched.
pub fn run_supervised_raw(
    command: &mut Command,
    supervision: Supervision<'_>,
    log: Option<Arc<TaskLog>>,
) -> ProcessResult<RawOutput> {
    let program = program_name(command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    debug!(program = %program, args = ?command.get_args().collect::<Vec<_>>(), "spawning process");
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .map(|out| spawn_reader(out, "stdout", log.clone()));
    let stderr = child
        .stderr
        .take()
        .map(|err| spawn_reader(err, "stderr", log.clone()));

    let io_err = |source| ProcessError::Io {
        program: program.clone(),
        source,
    };

    let interrupted = loop {
        if let Some(status) = child.try_wait().map_err(io_err)? {
            break Ok(status);
        }
        if let Err(e) = supervision.check(&program) {
            break Err(e);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let status = match interrupted {
        Ok(status) => status,
        Err(e) => {
            warn!(program = %program, pid = child.id(), "terminating process: {}", e);
            terminate(&mut child, TERMINATION_GRACE);
            join_reader(stdout);
            join_reader(stderr);
            return Err(e);
        }
    };

    kill_leftovers(&child, &program);

    // a process that left the group can still hold a pipe; stay supervised
    while [&stdout, &stderr]
        .into_iter()
        .flatten()
        .any(|reader| !reader.is_finished())
    {
        if let Err(e) = supervision.check(&program) {
            warn!(program = %program, "output still open after exit: {}", e);
            return Err(e);
        }
        thread::sleep(POLL_INTERVAL);
    }

    Ok(RawOutput {
        status,
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
    })
}

impl Supervision<'_> {
    fn check(&self, program: &str) -> ProcessResult<()> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(ProcessError::Cancelled {
                program: program.to_string(),
            });
        }
        if let Some(deadline) = self.deadline {
            if deadline.check().is_expired() {
                return Err(ProcessError::TimedOut {
                    program: program.to_string(),
                    timeout: deadline.limit(),
                });
            }
        }
        Ok(())
    }
}

/// Run a command and capture its output, without a log or cancellation.
pub fn run_captured(command: &mut Command) -> ProcessResult<ProcessOutput> {
    run_supervised(command, Supervision::default(), None)
}

/// Run a command with its own timeout. Used for cleanup commands that must
/// not hang a worker.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> ProcessResult<ProcessOutput> {
    let deadline = Deadline::after(timeout);
    run_supervised(
        command,
        Supervision {
            deadline: Some(&deadline),
            ..Supervision::default()
        },
        None,
    )
}

fn spawn_reader<R>(stream: R, prefix: &'static str, log: Option<Arc<TaskLog>>) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut captured = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(log) = &log {
                        log.line(prefix, &String::from_utf8_lossy(&line));
                    }
                    captured.extend_from_slice(&line);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        captured
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// SIGKILL whatever is left in the group of an exited leader.
fn kill_leftovers(child: &Child, program: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // ESRCH means the group is already empty
        if killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL).is_ok() {
            debug!(program = %program, pid = child.id(), "killed processes left in group");
        }
    }
    #[cfg(not(unix))]
    let _ = (child, program);
}

/// SIGTERM the process group, wait up to `grace`, then SIGKILL.
pub fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(child.id() as i32);
        let _ = killpg(pgid, Signal::SIGTERM);

        let start = Instant::now();
        while start.elapsed() < grace {
            match child.try_wait() {
                Ok(Some(_)) => {
                    // the leader is gone; make sure nothing in its group lingers
                    let _ = killpg(pgid, Signal::SIGKILL);
                    return;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::timeout::TaskTimeout;
    use tempfile::TempDir;

    #[test]
    fn test_captures_stdout_and_stderr() {
        let output = run_captured(Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code(), Some(3));
        assert!(!output.success());
    }

    #[test]
    fn test_streams_into_log() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(TaskLog::create(temp.path(), "repo", true).unwrap());
        let output = run_supervised(
            Command::new("sh").args(["-c", "echo hello"]),
            Supervision::default(),
            Some(Arc::clone(&log)),
        )
        .unwrap();
        assert!(output.success());

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "stdout: hello\n");
    }

    #[test]
    fn test_spawn_failure() {
        let err = run_captured(&mut Command::new("/nonexistent/batch-exec-binary")).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_deadline_kills_process() {
        let deadline = TaskTimeout::new(Duration::from_millis(300)).unwrap().start();
        let start = Instant::now();
        let err = run_supervised(
            Command::new("sleep").arg("30"),
            Supervision {
                deadline: Some(&deadline),
                ..Supervision::default()
            },
            None,
        )
        .unwrap_err();

        assert!(matches!(err, ProcessError::TimedOut { timeout, .. } if timeout == Duration::from_millis(300)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancel_kills_process() {
        let token = CancelToken::new();
        let canceller = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });

        let err = run_supervised(
            Command::new("sleep").arg("30"),
            Supervision {
                cancel: Some(&token),
                ..Supervision::default()
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }

    #[test]
    fn test_within_deadline_is_not_timeout() {
        let deadline = TaskTimeout::new(Duration::from_secs(20)).unwrap().start();
        let output = run_supervised(
            Command::new("sh").args(["-c", "sleep 0.1; echo done"]),
            Supervision {
                deadline: Some(&deadline),
                ..Supervision::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(output.stdout, "done\n");
    }

    #[test]
    fn test_background_child_is_killed_with_leader() {
        let deadline = TaskTimeout::new(Duration::from_secs(1)).unwrap().start();
        let start = Instant::now();
        let output = run_supervised(
            Command::new("sh").args(["-c", "sleep 30 & echo x"]),
            Supervision {
                deadline: Some(&deadline),
                ..Supervision::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(output.stdout, "x\n");
        assert!(output.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_raw_output_keeps_invalid_utf8() {
        let raw = run_supervised_raw(
            Command::new("printf").arg("caf\\351\\n"),
            Supervision::default(),
            None,
        )
        .unwrap();
        assert_eq!(raw.stdout, b"caf\xe9\n");

        let lossy = ProcessOutput::from(raw);
        assert_eq!(lossy.stdout, "caf\u{fffd}\n");
    }
}
