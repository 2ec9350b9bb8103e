//! Handle over a spawned remote shell process.
//!
//! # Architecture
//!
//! - `ProcessHandle`: the boundary the trace session drives. It offers signal
//!   delivery, a bounded wait, a forced kill and the captured output.
//! - `ShellProcess`: production implementation over `tokio::process::Child`.
//!   A background task owns the child, feeds the script to its stdin, drains
//!   stdout/stderr and publishes the captured output once the child exits.
//!
//! # Thread Safety
//!
//! Exit is published through a `watch` channel so any number of callers can
//! wait on it concurrently. Signal delivery to a process that already exited
//! is a no-op.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::ProxyError;

/// How long output pipes may stay open after the shell exited
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl OutputBuffer {
    /// Create a new output buffer with pre-allocated capacity.
    pub fn with_capacity(stdout_cap: usize, stderr_cap: usize) -> Self {
        Self {
            stdout: Vec::with_capacity(stdout_cap),
            stderr: Vec::with_capacity(stderr_cap),
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Result of a bounded wait on a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process exited within the bound
    Exited,
    /// The bound elapsed first, the process may still be running
    TimedOut,
}

/// Control surface over a spawned shell process.
///
/// Implementations must be thread-safe (`Send + Sync`): the trace session's
/// supervisor task, its watchdog and request handlers all hold the same handle.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Deliver an interrupt signal. A no-op once the process has exited.
    fn interrupt(&self) -> Result<(), ProxyError>;

    /// Wait up to `timeout` for the process to exit.
    async fn wait(&self, timeout: Duration) -> WaitOutcome;

    /// Forcibly kill the process and wait for it to be reaped.
    async fn kill(&self);

    /// Wait for the process to exit and return everything it wrote.
    async fn output(&self) -> OutputBuffer;
}

/// A local process whose stdin receives a script, typically `adb shell`.
pub struct ShellProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<Arc<OutputBuffer>>>,
    kill_token: CancellationToken,
}

impl ShellProcess {
    /// Spawn `program` with `args`, write `script` to its stdin and close it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(program: &str, args: &[&str], script: Vec<u8>) -> std::io::Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a Ctrl-C in the proxy terminal does not reach the shell
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn()?;

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();

        tokio::spawn(supervise_child(child, script, kill_token.clone(), exit_tx));

        Ok(Self {
            pid,
            exit_rx,
            kill_token,
        })
    }

    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    async fn wait_exit(&self) -> Arc<OutputBuffer> {
        let mut rx = self.exit_rx.clone();
        let output = match rx.wait_for(|output| output.is_some()).await {
            Ok(output) => (*output).clone().unwrap_or_default(),
            // Supervisor task is gone without publishing, nothing left to wait for
            Err(_) => Arc::default(),
        };
        output
    }

    #[cfg(unix)]
    fn send_interrupt(&self, pid: u32) -> Result<(), ProxyError> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| ProxyError::Internal(format!("pid {} out of range", pid)))?;
        match kill(Pid::from_raw(raw), Signal::SIGINT) {
            // ESRCH: exited between the check and the signal
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProxyError::Internal(format!(
                "Failed to send SIGINT to process {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn send_interrupt(&self, _pid: u32) -> Result<(), ProxyError> {
        self.kill_token.cancel();
        Ok(())
    }
}

#[async_trait]
impl ProcessHandle for ShellProcess {
    fn interrupt(&self) -> Result<(), ProxyError> {
        if self.has_exited() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => self.send_interrupt(pid),
            None => Ok(()),
        }
    }

    async fn wait(&self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.wait_exit()).await {
            Ok(_) => WaitOutcome::Exited,
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    async fn kill(&self) {
        self.kill_token.cancel();
        self.wait_exit().await;
    }

    async fn output(&self) -> OutputBuffer {
        (*self.wait_exit().await).clone()
    }
}

/// Own the child until it exits: feed stdin, drain both output pipes, honour
/// kill requests, then publish the captured output.
async fn supervise_child(
    mut child: Child,
    script: Vec<u8>,
    kill_token: CancellationToken,
    exit_tx: watch::Sender<Option<Arc<OutputBuffer>>>,
) {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let exited = CancellationToken::new();

    let mut output = OutputBuffer::with_capacity(4096, 1024);

    let feed = async move {
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(&script).await {
                debug!("Shell closed its stdin early: {}", e);
            }
            // Dropping stdin closes the pipe
        }
    };

    let wait = async {
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_token.cancelled() => None,
        };
        let status = match status {
            Some(status) => status,
            None => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill shell process: {}", e);
                }
                child.wait().await
            }
        };
        exited.cancel();
        status
    };

    let drain = async {
        let reads = async {
            tokio::join!(
                read_into(stdout, &mut output.stdout),
                read_into(stderr, &mut output.stderr)
            );
        };
        tokio::pin!(reads);
        tokio::select! {
            _ = &mut reads => {}
            _ = async {
                exited.cancelled().await;
                tokio::time::sleep(PIPE_DRAIN_GRACE).await;
            } => {
                debug!("Output pipes still open {:?} after shell exit, abandoning them", PIPE_DRAIN_GRACE);
            }
        }
    };

    let (_, status, _) = tokio::join!(feed, wait, drain);
    match status {
        Ok(status) => debug!("Shell process exited with {}", status),
        Err(e) => warn!("Failed to wait for shell process: {}", e),
    }

    exit_tx.send_replace(Some(Arc::new(output)));
}

async fn read_into<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) {
    if let Some(mut pipe) = pipe
        && let Err(e) = pipe.read_to_end(buf).await
    {
        debug!("Error reading shell output: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod output_buffer {
        use super::*;

        #[test]
        fn test_default() {
            let buffer = OutputBuffer::default();
            assert!(buffer.stdout.is_empty());
            assert!(buffer.stderr.is_empty());
        }

        #[test]
        fn test_with_capacity() {
            let buffer = OutputBuffer::with_capacity(4096, 1024);
            assert!(buffer.stdout.is_empty());
            assert!(buffer.stdout.capacity() >= 4096);
            assert!(buffer.stderr.capacity() >= 1024);
        }

        #[test]
        fn test_lossy_text() {
            let buffer = OutputBuffer {
                stdout: b"ok\n".to_vec(),
                stderr: vec![0xff, b'x'],
            };
            assert_eq!(buffer.stdout_text(), "ok\n");
            assert_eq!(buffer.stderr_text(), "\u{fffd}x");
        }
    }

    #[cfg(unix)]
    mod shell_process {
        use super::*;

        fn spawn_sh(script: &str) -> ShellProcess {
            ShellProcess::spawn("sh", &[], script.as_bytes().to_vec()).unwrap()
        }

        #[tokio::test]
        async fn test_captures_stdout_and_stderr() {
            let process = spawn_sh("echo hello\necho oops >&2\nexit 0\n");

            assert_eq!(
                process.wait(Duration::from_secs(5)).await,
                WaitOutcome::Exited
            );
            let output = process.output().await;
            assert_eq!(output.stdout_text(), "hello\n");
            assert_eq!(output.stderr_text(), "oops\n");
        }

        #[tokio::test]
        async fn test_interrupt_runs_trap() {
            let process =
                spawn_sh("trap 'echo bye; exit 0' INT\necho ready\nwhile true; do sleep 0.1; done\n");

            // Give the shell time to install the trap
            tokio::time::sleep(Duration::from_millis(300)).await;
            process.interrupt().unwrap();

            assert_eq!(
                process.wait(Duration::from_secs(5)).await,
                WaitOutcome::Exited
            );
            let output = process.output().await;
            assert_eq!(output.stdout_text(), "ready\nbye\n");
        }

        #[tokio::test]
        async fn test_wait_times_out_then_kill() {
            let process = spawn_sh("trap '' INT\nwhile true; do sleep 0.1; done\n");

            tokio::time::sleep(Duration::from_millis(200)).await;
            process.interrupt().unwrap();
            assert_eq!(
                process.wait(Duration::from_millis(300)).await,
                WaitOutcome::TimedOut
            );

            process.kill().await;
            assert_eq!(
                process.wait(Duration::from_millis(10)).await,
                WaitOutcome::Exited
            );
        }

        #[tokio::test]
        async fn test_interrupt_after_exit_is_noop() {
            let process = spawn_sh("exit 0\n");
            process.output().await;
            assert!(process.interrupt().is_ok());
        }

        #[tokio::test]
        async fn test_shell_runs_in_own_process_group() {
            use nix::unistd::{Pid, getpgid, getpgrp};

            let process = spawn_sh("while true; do sleep 0.1; done\n");
            let pid = Pid::from_raw(process.pid.unwrap() as i32);

            let group = getpgid(Some(pid)).unwrap();
            assert_eq!(group, pid);
            assert_ne!(group, getpgrp());

            process.kill().await;
        }

        #[tokio::test]
        async fn test_spawn_missing_binary_fails() {
            let result = ShellProcess::spawn("definitely-not-a-real-binary-xyz", &[], Vec::new());
            assert!(result.is_err());
        }
    }
}
