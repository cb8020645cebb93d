// ABOUTME: Engine subprocess handle with launch probe, line I/O and graceful termination
//
// Owns one engine process and its stdin/stdout pipes. A waiter task owns the
// tokio Child, reaps it as soon as it exits and publishes the exit through a
// watch channel, so liveness checks never block and never touch the process.
// Termination sends SIGTERM, waits a bounded grace period, then force-kills.
//
//   EngineProcess ──stdin──▶ engine
//        ▲        ◀─stdout── engine
//        │
//   waiter task (owns Child) ──watch──▶ ProcessLiveness (cloneable probe)

// Allow if-let/else patterns instead of map_or_else for readability
#![allow(clippy::option_if_let_else)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::line_buffer::LineBuffer;

const READ_CHUNK_BYTES: usize = 4096;

/// Errors raised by the process handle
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Executable missing, spawn failed, or the process exited immediately
    #[error("Failed to launch '{program}': {reason}")]
    Launch {
        /// Program as configured
        program: String,
        /// What went wrong
        reason: String,
    },

    /// Write attempted after the process exited or closed its input
    #[error("Broken pipe: engine process has exited")]
    BrokenPipe,

    /// The process closed its output
    #[error("End of stream: engine closed its output")]
    EndOfStream,

    /// Other pipe I/O failure
    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current state of an engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is running with the given PID
    Running {
        /// Process ID
        pid: u32,
    },

    /// Process exited normally with exit code
    Exited {
        /// Exit code from the process
        code: i32,
    },

    /// Process was terminated by a signal
    Signaled {
        /// Signal number that terminated the process
        signal: i32,
    },

    /// Waiting on the process failed
    Failed {
        /// Description of the failure
        reason: String,
    },
}

impl ProcessState {
    /// Returns true if the process is currently running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Exponential backoff calculator for restart delays
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay duration
    base: Duration,

    /// Maximum delay cap
    max: Duration,

    /// Current attempt number (0-indexed)
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff calculator
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter
    ///
    /// Returns `min(base * 2^attempt, max)`
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.current_attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        self.current_attempt = self.current_attempt.saturating_add(1);

        std::cmp::min(delay, self.max)
    }

    /// Reset the attempt counter to 0
    pub const fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Get the current attempt number
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Everything needed to launch an engine process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable path or bare name resolved through `PATH`
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// A process that exits within this window counts as a launch failure
    pub launch_probe: Duration,
}

/// Cloneable, non-blocking view of a process's liveness
#[derive(Debug, Clone)]
pub struct ProcessLiveness {
    pid: u32,
    state: watch::Receiver<ProcessState>,
    last_activity: Arc<Mutex<Instant>>,
}

impl ProcessLiveness {
    /// Whether the process is still running; never blocks, no side effects
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.borrow().is_running()
    }

    /// Latest observed process state
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Process ID
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// When a line was last written to or read from the process
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("Mutex poisoned")
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("Mutex poisoned") = Instant::now();
    }
}

/// Handle owning one running engine subprocess
pub struct EngineProcess {
    /// Engine name, for logging
    name: String,

    /// Child's stdin; `None` once closed for shutdown
    stdin: Option<ChildStdin>,

    /// Child's stdout
    stdout: ChildStdout,

    /// Unterminated output
    buffer: LineBuffer,

    /// stdout reached end of stream
    eof: bool,

    /// Liveness published by the waiter task
    liveness: ProcessLiveness,

    /// Asks the waiter task to force-kill
    kill_tx: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("name", &self.name)
            .field("pid", &self.liveness.pid)
            .field("state", &self.liveness.state())
            .finish_non_exhaustive()
    }
}

impl EngineProcess {
    /// Launch the engine and wire its stdin/stdout
    ///
    /// # Errors
    /// Returns `ProcessError::Launch` if the executable cannot be found or
    /// spawned, or if the process exits within the launch probe window.
    pub async fn start(name: &str, spec: &LaunchSpec) -> Result<Self, ProcessError> {
        let program = resolve_program(&spec.program)?;

        debug!(engine = %name, program = %program.display(), args = ?spec.args, "Spawning engine process");

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ProcessError::Launch {
            program: program.display().to_string(),
            reason: e.to_string(),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ProcessError::Launch {
                program: program.display().to_string(),
                reason: "stdio pipes unavailable".to_string(),
            });
        };
        let pid = child.id().unwrap_or(0);

        let (state_tx, mut state_rx) = watch::channel(ProcessState::Running { pid });
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(reap(name.to_string(), child, state_tx, kill_rx));

        // Launch probe: an engine that cannot load its weights or rejects its
        // arguments usually exits straight away
        if let Ok(Ok(())) = tokio::time::timeout(spec.launch_probe, state_rx.changed()).await {
            let state = state_rx.borrow().clone();
            if !state.is_running() {
                return Err(ProcessError::Launch {
                    program: program.display().to_string(),
                    reason: format!("exited immediately ({state:?})"),
                });
            }
        }

        info!(engine = %name, pid = pid, "Engine process spawned");

        Ok(Self {
            name: name.to_string(),
            stdin: Some(stdin),
            stdout,
            buffer: LineBuffer::new(),
            eof: false,
            liveness: ProcessLiveness {
                pid,
                state: state_rx,
                last_activity: Arc::new(Mutex::new(Instant::now())),
            },
            kill_tx: Some(kill_tx),
        })
    }

    /// Send one command line; the newline is appended here
    ///
    /// # Errors
    /// Returns `ProcessError::BrokenPipe` if the process has exited.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProcessError> {
        if !self.liveness.is_alive() {
            return Err(ProcessError::BrokenPipe);
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ProcessError::BrokenPipe);
        };

        debug!(engine = %self.name, ">> {line}");

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let written = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.liveness.touch();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(ProcessError::BrokenPipe),
            Err(e) => Err(ProcessError::Io(e)),
        }
    }

    /// Wait for the next complete output line
    ///
    /// Cancel-safe: bytes already read stay buffered if the future is dropped.
    ///
    /// # Errors
    /// Returns `ProcessError::EndOfStream` once the process has closed its
    /// output and every buffered line has been consumed.
    pub async fn read_line(&mut self) -> Result<String, ProcessError> {
        loop {
            if let Some(line) = self.buffer.next_line() {
                self.liveness.touch();
                debug!(engine = %self.name, "<< {line}");
                return Ok(line);
            }
            if self.eof {
                return match self.buffer.finish() {
                    Some(line) => {
                        debug!(engine = %self.name, "<< {line}");
                        Ok(line)
                    }
                    None => Err(ProcessError::EndOfStream),
                };
            }

            let mut chunk = [0u8; READ_CHUNK_BYTES];
            let read = self.stdout.read(&mut chunk).await?;
            if read == 0 {
                self.eof = true;
            } else {
                self.buffer.push(&chunk[..read]);
            }
        }
    }

    /// Non-blocking, side-effect-free liveness check
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Cloneable liveness probe for the health monitor
    #[must_use]
    pub fn liveness(&self) -> ProcessLiveness {
        self.liveness.clone()
    }

    /// Process ID
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.liveness.pid
    }

    /// Gracefully terminate the process
    ///
    /// Closes stdin and sends SIGTERM, waits up to `grace`, then force-kills.
    /// Returns the final process state.
    pub async fn terminate(mut self, grace: Duration) -> ProcessState {
        if !self.liveness.is_alive() {
            return self.liveness.state();
        }

        let pid = self.liveness.pid;
        info!(engine = %self.name, pid = pid, "Terminating engine process");

        self.stdin = None;

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(pid) {
                if raw > 0 {
                    let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                }
            }
        }

        if self.wait_for_exit(grace).await {
            debug!(engine = %self.name, pid = pid, "Engine process terminated gracefully");
        } else {
            warn!(
                engine = %self.name,
                pid = pid,
                "Engine process did not terminate gracefully, killing"
            );
            self.kill().await;
        }

        self.liveness.state()
    }

    /// Force-kill immediately and wait for the exit to be reaped
    pub async fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        // The waiter task reaps right after the kill lands
        if !self.wait_for_exit(Duration::from_secs(5)).await {
            error!(engine = %self.name, pid = self.liveness.pid, "Engine process survived kill");
        }
    }

    /// Wait up to `limit` for the process to exit; true if it did
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut state = self.liveness.state.clone();
        tokio::time::timeout(limit, state.wait_for(|s| !s.is_running()))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Waiter task: owns the Child until it exits or a kill is requested
async fn reap(
    name: String,
    mut child: Child,
    state_tx: watch::Sender<ProcessState>,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill and when the handle is dropped
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(engine = %name, error = %e, "Failed to kill engine process");
            }
            child.wait().await
        }
    };

    let state = match status {
        Ok(status) => exit_state(status),
        Err(e) => ProcessState::Failed {
            reason: format!("wait failed: {e}"),
        },
    };
    debug!(engine = %name, state = ?state, "Engine process reaped");
    let _ = state_tx.send(state);
}

fn exit_state(status: std::process::ExitStatus) -> ProcessState {
    if let Some(code) = status.code() {
        return ProcessState::Exited { code };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessState::Signaled { signal };
        }
    }

    ProcessState::Failed {
        reason: "Unknown termination".to_string(),
    }
}

/// Resolve a bare program name through `PATH`; paths must exist
fn resolve_program(program: &Path) -> Result<PathBuf, ProcessError> {
    let launch_error = |reason: String| ProcessError::Launch {
        program: program.display().to_string(),
        reason,
    };

    if program.as_os_str().is_empty() {
        return Err(launch_error("executable path is empty".to_string()));
    }

    if program.components().count() > 1 {
        if program.is_file() {
            Ok(program.to_path_buf())
        } else {
            Err(launch_error("executable not found".to_string()))
        }
    } else {
        which::which(program).map_err(|e| launch_error(e.to_string()))
    }
}
