//! Trace session state machine.
//!
//! A trace session owns one monitored `adb shell` for a (device, target) pair.
//!
//! # Lifecycle
//!
//! ```text
//! Starting -> Running -> Stopping -> Completed | TimedOut | Failed
//! ```
//!
//! 1. **Start**: a monitored script is generated and spawned. The script marks
//!    the status file with `TRACE_START`, installs a termination handler that
//!    runs the stop command and writes `TRACE_OK`, runs the start command, then
//!    idles in a short sleep loop so the handler runs promptly on a signal.
//! 2. **Keep-alive**: every status poll rearms the watchdog. If the client goes
//!    quiet for the keep-alive interval, the watchdog stops the session.
//! 3. **Stop**: the watchdog is disabled, the shell receives SIGINT and gets
//!    the command timeout to exit before it is killed.
//! 4. **Reconciliation**: once the shell is gone, a supervisor task polls the
//!    status file for `TRACE_OK` and settles the final state.
//!
//! Sessions are never removed from the registry by the watchdog. Only an
//! explicit end-trace request does that.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backon::{ConstantBuilder, Retryable};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::adb::{CommandExecutor, ShellLauncher};
use super::config::TraceTimings;
use super::error::ProxyError;
use super::process::{OutputBuffer, ProcessHandle, WaitOutcome};
use super::types::{StartTraceRequest, TraceOutcome};
use super::watchdog::Watchdog;

/// Device-side prefix of per-target status-marker files
pub const STATUS_FILE_PREFIX: &str = "/data/local/tmp/winscope_status";

/// Device-side log the termination handler writes to, shared by all sessions
pub const SIGNAL_HANDLER_LOG: &str = "/data/local/tmp/winscope_signal_handler.log";

/// Status-marker content once the termination handler has finished
pub(crate) const COMPLETION_MARKER: &str = "TRACE_OK\n";

/// Target whose cleanup writes to stderr even on success
pub(crate) const ALWAYS_SUCCEEDS_TARGET: &str = "PerfettoTrace";

/// Status-marker path for a target.
pub fn status_file_for(target_id: &str) -> String {
    format!("{}_{}", STATUS_FILE_PREFIX, target_id)
}

/// Build the monitored shell script run on the device.
///
/// `start_cmd` and `stop_cmd` are interpolated as is, without any escaping.
pub fn build_trace_script(status_file: &str, stop_cmd: &str, start_cmd: &str) -> String {
    format!(
        r#"
set -e

echo "Opening shell..."
echo "TRACE_START" > {winscope_status}

# Do not print anything to stdout/stderr in the handler
function close_shell() {{
  echo "start" >{signal_handler_log}

  # redirect stdout/stderr to log file
  exec 1>>{signal_handler_log}
  exec 2>>{signal_handler_log}

  set -x
  trap - EXIT HUP INT
  {stop_commands}
  echo "TRACE_OK" > {winscope_status}
}}

trap close_shell EXIT HUP INT
echo "Signal handler registered."

{start_commands}

# ADB shell does not handle hung up well and does not call HUP handler when a child is active in foreground,
# as a workaround we sleep for short intervals in a loop so the handler is called after a sleep interval.
while true; do sleep 0.1; done
"#,
        winscope_status = status_file,
        signal_handler_log = SIGNAL_HANDLER_LOG,
        stop_commands = stop_cmd,
        start_commands = start_cmd,
    )
}

/// State of a trace session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Shell being spawned
    Starting,
    /// Shell up, trace in progress
    Running,
    /// Shell signalled or exited, cleanup in progress
    Stopping,
    /// Cleanup confirmed and the trace succeeded
    Completed,
    /// Cleanup never confirmed within the command timeout
    TimedOut,
    /// Cleanup confirmed but the trace reported errors
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::TimedOut => write!(f, "timed_out"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// One trace collection on one device.
pub struct TraceSession {
    device_id: String,
    target_id: String,
    status_file: String,
    script: String,
    timings: TraceTimings,
    process: Arc<dyn ProcessHandle>,
    executor: Arc<dyn CommandExecutor>,
    watchdog: Watchdog,
    state_tx: watch::Sender<SessionState>,
    /// Populated once the shell has exited
    output: Mutex<Option<OutputBuffer>>,
    success: AtomicBool,
    timed_out: AtomicBool,
    stop_started: AtomicBool,
    /// Flips to `true` once the stop sequence has finished
    stop_done: watch::Sender<bool>,
}

impl TraceSession {
    /// Spawn the monitored shell and start supervising it.
    ///
    /// Returns as soon as the shell is spawned. A spawn failure is reported as
    /// [`ProxyError::Adb`] and leaves nothing running.
    pub fn start(
        device_id: &str,
        request: &StartTraceRequest,
        launcher: &dyn ShellLauncher,
        executor: Arc<dyn CommandExecutor>,
        timings: TraceTimings,
    ) -> Result<Arc<Self>, ProxyError> {
        let target_id = request.target_id.clone();
        let status_file = status_file_for(&target_id);
        let script = build_trace_script(&status_file, &request.stop_cmd, &request.start_cmd);

        debug!("Executing start command for {} on {}...", target_id, device_id);
        let process = launcher
            .launch(device_id, script.clone().into_bytes())
            .map_err(|e| {
                ProxyError::adb(format!(
                    "Error executing adb command for trace {}: {:?}",
                    target_id, e
                ))
            })?;

        let (state_tx, _) = watch::channel(SessionState::Starting);
        let (stop_done, _) = watch::channel(false);
        let session = Arc::new(Self {
            device_id: device_id.to_string(),
            target_id,
            status_file,
            script,
            timings,
            process,
            executor,
            watchdog: Watchdog::new(timings.keep_alive),
            state_tx,
            output: Mutex::new(None),
            success: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            stop_started: AtomicBool::new(false),
            stop_done,
        });

        session.reset_keep_alive();
        session.state_tx.send_replace(SessionState::Running);
        tokio::spawn(Arc::clone(&session).supervise());

        info!("Trace {} started on {}", session.target_id, session.device_id);
        Ok(session)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn status_file(&self) -> &str {
        &self.status_file
    }

    /// The generated monitored script
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Whether the session has not reached a terminal state yet.
    pub fn is_alive(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn success(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Captured shell output, `None` until the shell has exited.
    pub async fn output(&self) -> Option<OutputBuffer> {
        self.output.lock().await.clone()
    }

    /// Rearm the keep-alive watchdog. Ignored once the session is stopping.
    pub fn reset_keep_alive(self: &Arc<Self>) {
        if self.watchdog.is_stopped() {
            return;
        }
        debug!(
            "Resetting keep-alive clock for {} trace on {}",
            self.target_id, self.device_id
        );
        let session = Arc::downgrade(self);
        self.watchdog.reset(move || async move {
            if let Some(session) = session.upgrade() {
                session.on_keep_alive_expired().await;
            }
        });
    }

    async fn on_keep_alive_expired(self: &Arc<Self>) {
        if self.is_alive() {
            warn!(
                "Keep-alive timeout for {} trace on {}",
                self.target_id, self.device_id
            );
            self.end_trace().await;
        }
    }

    /// Stop the trace and wait for cleanup to settle.
    ///
    /// Safe to call concurrently and repeatedly: the stop sequence runs once,
    /// in its own task, and every caller returns after it has finished. A
    /// caller dropped midway leaves the sequence running.
    pub async fn end_trace(self: &Arc<Self>) {
        if !self.stop_started.swap(true, Ordering::SeqCst) {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.stop_sequence().await;
                session.stop_done.send_replace(true);
            });
        }
        let mut done = self.stop_done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    async fn stop_sequence(&self) {
        self.watchdog.stop();
        self.state_tx.send_if_modified(|state| match state {
            SessionState::Starting | SessionState::Running => {
                *state = SessionState::Stopping;
                true
            }
            _ => false,
        });

        info!(
            "Sending SIGINT to the {} process on {}",
            self.target_id, self.device_id
        );
        if let Err(e) = self.process.interrupt() {
            warn!("Failed to interrupt {} trace shell: {}", self.target_id, e);
        }

        debug!(
            "Waiting for {} trace shell to exit for {}",
            self.target_id, self.device_id
        );
        if self.process.wait(self.timings.command_timeout).await == WaitOutcome::TimedOut {
            error!(
                "TIMEOUT - sending SIGKILL to the {} trace process on {}",
                self.target_id, self.device_id
            );
            self.process.kill().await;
            self.timed_out.store(true, Ordering::SeqCst);
        }

        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Wait for the shell to exit, then reconcile the final state.
    async fn supervise(self: Arc<Self>) {
        let output = self.process.output().await;
        info!(
            "Trace {} ended on {}, waiting for cleanup",
            self.target_id, self.device_id
        );
        let stderr_empty = output.stderr.is_empty();
        *self.output.lock().await = Some(output);

        // Shell may have exited on its own without a stop request
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Stopping;
                true
            } else {
                false
            }
        });

        tokio::time::sleep(self.timings.settle_delay).await;

        let final_state = if self.await_completion_marker().await {
            info!("Trace {} finished on {}", self.target_id, self.device_id);
            let success = self.target_id == ALWAYS_SUCCEEDS_TARGET || stderr_empty;
            self.success.store(success, Ordering::SeqCst);
            if success {
                SessionState::Completed
            } else {
                SessionState::Failed
            }
        } else {
            warn!(
                "Trace {} on {} never reported cleanup completion",
                self.target_id, self.device_id
            );
            self.timed_out.store(true, Ordering::SeqCst);
            SessionState::TimedOut
        };

        self.state_tx.send_replace(final_state);
    }

    /// Poll the status-marker file until it reads [`COMPLETION_MARKER`],
    /// reading it at most `command_timeout / poll_interval` times.
    async fn await_completion_marker(&self) -> bool {
        // Retries follow the first read
        let backoff = ConstantBuilder::default()
            .with_delay(self.timings.poll_interval)
            .with_max_times(self.timings.max_polls().saturating_sub(1));

        let params = format!("shell su root cat {}", self.status_file);
        let executor = &self.executor;
        let device_id = self.device_id.as_str();
        let params = params.as_str();

        (move || async move {
            let content = executor
                .run(Some(device_id), params)
                .await
                .map_err(|e| e.to_string())?;
            if content == COMPLETION_MARKER {
                Ok(())
            } else {
                Err(format!("status marker reads {:?}", content.trim_end()))
            }
        })
        .retry(backoff)
        .notify(|err: &String, _| {
            debug!(
                "Still waiting for cleanup on {} for {}: {}",
                self.device_id, self.target_id, err
            );
        })
        .await
        .is_ok()
    }

    /// Assemble the end-of-trace report from the session flags, the captured
    /// shell output and the device's signal handler log.
    pub async fn outcome(&self, signal_handler_log: &str) -> TraceOutcome {
        let output = self.output().await.unwrap_or_default();
        let stdout = output.stdout_text();
        let stderr = output.stderr_text();

        let log = format!(
            "### Shell script's stdout ###\n{}\n### Shell script's stderr ###\n{}\n### Signal handler log ###\n{}\n",
            non_empty_or(&stdout, "<no stdout>"),
            non_empty_or(&stderr, "<no stderr>"),
            non_empty_or(signal_handler_log, "<no signal handler logs>"),
        );

        TraceOutcome {
            timed_out: self.timed_out(),
            success: self.success(),
            log,
        }
    }
}

impl fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSession")
            .field("device_id", &self.device_id)
            .field("target_id", &self.target_id)
            .field("state", &self.state())
            .finish()
    }
}

fn non_empty_or<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.is_empty() { placeholder } else { text }
}
