//! Device-bridge (`adb`) invocation.
//!
//! Two seams isolate everything that touches the `adb` binary:
//!
//! - `CommandExecutor`: runs a single command to completion and returns its
//!   output. Used for device listing, passthrough commands, file retrieval
//!   and status-marker polling.
//! - `ShellLauncher`: starts a long-lived `adb shell` fed with a script and
//!   returns a [`ProcessHandle`] over it. Used by trace sessions.
//!
//! Both are traits so the trace session and the endpoints can be exercised
//! without a device attached.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::error::ProxyError;
use super::process::{ProcessHandle, ShellProcess};

/// Runs one device-bridge command to completion.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `adb [-s device] <params>` and return stdout followed by stderr.
    ///
    /// A non-zero exit is not an error: the returned text then starts with
    /// `Error executing adb command:`. Only a failure to launch the binary is
    /// reported as [`ProxyError::Adb`].
    async fn run(&self, device: Option<&str>, params: &str) -> Result<String, ProxyError>;

    /// Run `adb -s device <params>` and return raw stdout bytes.
    ///
    /// Any non-zero exit is reported as [`ProxyError::Adb`].
    async fn run_raw(&self, device: &str, params: &str) -> Result<Vec<u8>, ProxyError>;
}

/// Starts remote shells on a device.
pub trait ShellLauncher: Send + Sync {
    /// Spawn a shell on `device_id` and write `script` to its stdin.
    fn launch(&self, device_id: &str, script: Vec<u8>)
    -> std::io::Result<Arc<dyn ProcessHandle>>;
}

/// Build the argument list for an adb invocation.
///
/// Parameters are split on single spaces, without any shell quoting.
pub(crate) fn adb_args(device: Option<&str>, params: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(device) = device {
        args.push("-s".to_string());
        args.push(device.to_string());
    }
    args.extend(params.split(' ').map(str::to_string));
    args
}

/// [`CommandExecutor`] backed by the real `adb` binary.
pub struct AdbExecutor {
    adb_path: String,
}

impl AdbExecutor {
    pub fn new(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    fn command_str(&self, args: &[String]) -> String {
        format!("{} {}", self.adb_path, args.join(" "))
    }
}

#[async_trait]
impl CommandExecutor for AdbExecutor {
    async fn run(&self, device: Option<&str>, params: &str) -> Result<String, ProxyError> {
        let args = adb_args(device, params);
        let command_str = self.command_str(&args);
        debug!("Call: {}", command_str);

        let output = Command::new(&self.adb_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ProxyError::adb(format!(
                    "OS Error executing adb command: {}\n{:?}",
                    command_str, e
                ))
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(text)
        } else {
            Ok(format!(
                "Error executing adb command: {}: {}",
                command_str, text
            ))
        }
    }

    async fn run_raw(&self, device: &str, params: &str) -> Result<Vec<u8>, ProxyError> {
        let args = adb_args(Some(device), params);
        let command_str = self.command_str(&args);
        debug!("Call: {}", command_str);

        let output = Command::new(&self.adb_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ProxyError::adb(format!(
                    "Error executing adb command: {}\n{:?}",
                    command_str, e
                ))
            })?;

        if !output.status.success() {
            return Err(ProxyError::adb(format!(
                "Error executing adb command: {}\n{}\n{}",
                command_str,
                String::from_utf8_lossy(&output.stderr),
                String::from_utf8_lossy(&output.stdout)
            )));
        }
        Ok(output.stdout)
    }
}

/// [`ShellLauncher`] running `adb -s <device> shell`.
pub struct AdbShellLauncher {
    adb_path: String,
}

impl AdbShellLauncher {
    pub fn new(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }
}

impl ShellLauncher for AdbShellLauncher {
    fn launch(
        &self,
        device_id: &str,
        script: Vec<u8>,
    ) -> std::io::Result<Arc<dyn ProcessHandle>> {
        let args = ["-s", device_id, "shell"];
        debug!("Starting trace shell {} {}", self.adb_path, args.join(" "));
        let process = ShellProcess::spawn(&self.adb_path, &args, script)?;
        Ok(Arc::new(process))
    }
}
