//! In-memory stand-ins for the adb seams, shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::adb::{CommandExecutor, ShellLauncher};
use super::config::TraceTimings;
use super::error::ProxyError;
use super::process::{OutputBuffer, ProcessHandle, WaitOutcome};
use super::router::ProxyContext;
use super::storage::DashMapTraceStorage;
use super::trace::{SIGNAL_HANDLER_LOG, STATUS_FILE_PREFIX};
use super::types::StartTraceRequest;

pub(crate) const TEST_TOKEN: &str =
    "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

/// Context over the fakes with a fresh registry.
pub(crate) fn test_context(launcher: Arc<FakeLauncher>, executor: Arc<FakeExecutor>) -> ProxyContext {
    test_context_with_registry(launcher, executor, Arc::new(DashMapTraceStorage::new()))
}

/// Context over the fakes sharing `registry` with the caller.
pub(crate) fn test_context_with_registry(
    launcher: Arc<FakeLauncher>,
    executor: Arc<FakeExecutor>,
    registry: Arc<DashMapTraceStorage>,
) -> ProxyContext {
    ProxyContext {
        token: TEST_TOKEN.to_string(),
        registry,
        executor,
        launcher,
        timings: fast_timings(),
    }
}

/// Timings short enough for tests to exercise expiry and timeouts.
pub(crate) fn fast_timings() -> TraceTimings {
    TraceTimings {
        keep_alive: Duration::from_millis(200),
        command_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        settle_delay: Duration::ZERO,
    }
}

pub(crate) fn start_request(target_id: &str) -> StartTraceRequest {
    StartTraceRequest {
        target_id: target_id.to_string(),
        start_cmd: format!("start_{}", target_id),
        stop_cmd: format!("stop_{}", target_id),
    }
}

/// Shell that exits on interrupt, or only on kill when stubborn.
pub(crate) struct FakeProcess {
    exits_on_interrupt: bool,
    output: OutputBuffer,
    exited: watch::Sender<bool>,
    interrupts: AtomicUsize,
    kills: AtomicUsize,
}

impl FakeProcess {
    fn new(exits_on_interrupt: bool, output: OutputBuffer) -> Arc<Self> {
        let (exited, _) = watch::channel(false);
        Arc::new(Self {
            exits_on_interrupt,
            output,
            exited,
            interrupts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        })
    }

    pub(crate) fn exit(&self) {
        self.exited.send_replace(true);
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub(crate) fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    async fn wait_exit(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn interrupt(&self) -> Result<(), ProxyError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.exits_on_interrupt {
            self.exit();
        }
        Ok(())
    }

    async fn wait(&self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.wait_exit()).await {
            Ok(()) => WaitOutcome::Exited,
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit();
    }

    async fn output(&self) -> OutputBuffer {
        self.wait_exit().await;
        self.output.clone()
    }
}

/// Launcher handing out [`FakeProcess`]es and recording every script.
pub(crate) struct FakeLauncher {
    fail: bool,
    exits_on_interrupt: bool,
    output: OutputBuffer,
    launched: Mutex<Vec<(String, String)>>,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeLauncher {
    fn build(fail: bool, exits_on_interrupt: bool, output: OutputBuffer) -> Self {
        Self {
            fail,
            exits_on_interrupt,
            output,
            launched: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn new() -> Self {
        Self::build(false, true, OutputBuffer::default())
    }

    pub(crate) fn failing() -> Self {
        Self::build(true, true, OutputBuffer::default())
    }

    pub(crate) fn ignoring_interrupts() -> Self {
        Self::build(false, false, OutputBuffer::default())
    }

    pub(crate) fn with_stderr(stderr: &[u8]) -> Self {
        Self::with_output(b"", stderr)
    }

    pub(crate) fn with_output(stdout: &[u8], stderr: &[u8]) -> Self {
        let output = OutputBuffer {
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        };
        Self::build(false, true, output)
    }

    /// (device, script) for every launch so far
    pub(crate) fn launched(&self) -> Vec<(String, String)> {
        self.launched.lock().unwrap().clone()
    }

    pub(crate) fn process(&self, index: usize) -> Arc<FakeProcess> {
        self.processes.lock().unwrap()[index].clone()
    }

    pub(crate) fn process_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }
}

impl ShellLauncher for FakeLauncher {
    fn launch(
        &self,
        device_id: &str,
        script: Vec<u8>,
    ) -> std::io::Result<Arc<dyn ProcessHandle>> {
        if self.fail {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "adb not found",
            ));
        }
        self.launched.lock().unwrap().push((
            device_id.to_string(),
            String::from_utf8_lossy(&script).into_owned(),
        ));
        let process = FakeProcess::new(self.exits_on_interrupt, self.output.clone());
        self.processes.lock().unwrap().push(process.clone());
        Ok(process)
    }
}

pub(crate) const FAKE_DEVICES_LISTING: &str = "List of devices attached\n\
emulator-5554          device product:sdk_gphone64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1\n\
R5CT1234ABC            unauthorized usb:1-1 transport_id:2\n\
\n";

pub(crate) const FAKE_SIGNAL_LOG: &str = "start\n+ trap - EXIT HUP INT\n";

/// Executor answering the commands the proxy issues with canned output.
pub(crate) struct FakeExecutor {
    marker_ready: AtomicBool,
    cleanup_fails: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    /// Status markers read `TRACE_OK`
    pub(crate) fn ready() -> Arc<Self> {
        Arc::new(Self {
            marker_ready: AtomicBool::new(true),
            cleanup_fails: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Status markers stay at `TRACE_START`
    pub(crate) fn not_ready() -> Arc<Self> {
        let executor = Self::ready();
        executor.marker_ready.store(false, Ordering::SeqCst);
        executor
    }

    /// Status markers read `TRACE_OK`, but reading the signal handler log
    /// and removing the marker fail
    pub(crate) fn failing_cleanup() -> Arc<Self> {
        let executor = Self::ready();
        executor.cleanup_fails.store(true, Ordering::SeqCst);
        executor
    }

    /// Every call so far as `device|params`, `-` for no device
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run(&self, device: Option<&str>, params: &str) -> Result<String, ProxyError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}|{}", device.unwrap_or("-"), params));

        if params.starts_with(&format!("shell su root cat {}", STATUS_FILE_PREFIX)) {
            let marker = if self.marker_ready.load(Ordering::SeqCst) {
                "TRACE_OK\n"
            } else {
                "TRACE_START\n"
            };
            return Ok(marker.to_string());
        }
        let is_cleanup = params == format!("shell su root cat {}", SIGNAL_HANDLER_LOG)
            || params.starts_with("shell su root rm");
        if is_cleanup && self.cleanup_fails.load(Ordering::SeqCst) {
            return Err(ProxyError::adb(format!(
                "Error executing adb command: adb -s {} {}\nerror: device offline",
                device.unwrap_or("-"),
                params
            )));
        }
        if params == format!("shell su root cat {}", SIGNAL_HANDLER_LOG) {
            return Ok(FAKE_SIGNAL_LOG.to_string());
        }
        if params == "devices -l" {
            return Ok(FAKE_DEVICES_LISTING.to_string());
        }
        if params.starts_with("shell su root rm") {
            return Ok(String::new());
        }
        Ok(format!("ran {}", params))
    }

    async fn run_raw(&self, device: &str, params: &str) -> Result<Vec<u8>, ProxyError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}|{}", device, params));

        if params.contains("missing") {
            return Err(ProxyError::adb(format!(
                "Error executing adb command: adb -s {} {}\nNo such file or directory",
                device, params
            )));
        }
        Ok(format!("contents of {}", params).into_bytes())
    }
}
