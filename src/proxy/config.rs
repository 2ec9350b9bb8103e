//! Configuration resolution for the ADB proxy.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value, e.g. a command line flag (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WINSCOPE_PROXY_PORT` | 5544 | Local port the proxy listens on |
//! | `WINSCOPE_KEEP_ALIVE_SECS` | 5s | Max silence between client status polls |
//! | `WINSCOPE_COMMAND_TIMEOUT_SECS` | 15s | Graceful exit and cleanup polling bound |
//! | `WINSCOPE_TOKEN_PATH` | `~/.config/winscope/.token` | Security token location |
//! | `ADB` | `adb` | Device-bridge binary |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default local port
pub(crate) const DEFAULT_PORT: u16 = 5544;

/// Max interval between client keep-alive requests in seconds
pub(crate) const DEFAULT_KEEP_ALIVE_SECS: u64 = 5;

/// Perfetto's default timeout for an ACK from producer processes is 5s,
/// this must stay above it with a good margin.
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 15;

/// Interval between reads of the status-marker file during cleanup
pub(crate) const MARKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between shell exit and the first status-marker read
pub(crate) const MARKER_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Default device-bridge binary, looked up in PATH
pub(crate) const DEFAULT_ADB_PATH: &str = "adb";

/// Token location relative to the home directory
pub(crate) const DEFAULT_TOKEN_RELATIVE_PATH: &str = ".config/winscope/.token";

/// Environment variable name for the listen port
pub(crate) const PORT_ENV_VAR: &str = "WINSCOPE_PROXY_PORT";

/// Environment variable name for the keep-alive interval
pub(crate) const KEEP_ALIVE_ENV_VAR: &str = "WINSCOPE_KEEP_ALIVE_SECS";

/// Environment variable name for the command timeout
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "WINSCOPE_COMMAND_TIMEOUT_SECS";

/// Environment variable name for the token file location
pub(crate) const TOKEN_PATH_ENV_VAR: &str = "WINSCOPE_TOKEN_PATH";

/// Environment variable name for the device-bridge binary
pub(crate) const ADB_PATH_ENV_VAR: &str = "ADB";

/// Timing parameters governing every trace session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceTimings {
    /// Silence after which a session is presumed abandoned by its client
    pub keep_alive: Duration,
    /// Bound for graceful shell exit, and for cleanup polling
    pub command_timeout: Duration,
    /// Interval between status-marker reads
    pub poll_interval: Duration,
    /// Pause before the first status-marker read
    pub settle_delay: Duration,
}

impl TraceTimings {
    /// Resolve timings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            keep_alive: resolve_keep_alive(None),
            command_timeout: resolve_command_timeout(None),
            ..Self::default()
        }
    }

    /// Number of status-marker reads that fit in the command timeout.
    pub fn max_polls(&self) -> usize {
        let interval = self.poll_interval.as_millis().max(1);
        (self.command_timeout.as_millis() / interval) as usize
    }
}

impl Default for TraceTimings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            poll_interval: MARKER_POLL_INTERVAL,
            settle_delay: MARKER_SETTLE_DELAY,
        }
    }
}

/// Resolve the listen port with priority: parameter -> env var -> default
pub fn resolve_port(port_param: Option<u16>) -> u16 {
    if let Some(port) = port_param {
        return port;
    }

    if let Ok(env_port) = env::var(PORT_ENV_VAR)
        && let Ok(port) = env_port.parse::<u16>()
    {
        return port;
    }

    DEFAULT_PORT
}

/// Resolve the keep-alive interval with priority: parameter -> env var -> default
pub(crate) fn resolve_keep_alive(secs_param: Option<u64>) -> Duration {
    resolve_secs(secs_param, KEEP_ALIVE_ENV_VAR, DEFAULT_KEEP_ALIVE_SECS)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_command_timeout(secs_param: Option<u64>) -> Duration {
    resolve_secs(secs_param, COMMAND_TIMEOUT_ENV_VAR, DEFAULT_COMMAND_TIMEOUT_SECS)
}

fn resolve_secs(secs_param: Option<u64>, env_var: &str, default: u64) -> Duration {
    if let Some(secs) = secs_param {
        return Duration::from_secs(secs);
    }

    // Zero would disable the watchdog or the cleanup bound, ignore it
    if let Ok(env_secs) = env::var(env_var)
        && let Ok(secs) = env_secs.parse::<u64>()
        && secs > 0
    {
        return Duration::from_secs(secs);
    }

    Duration::from_secs(default)
}

/// Resolve the token file path with priority: parameter -> env var -> default
///
/// The default lives under the user's home directory. When no home directory
/// can be determined the relative path is used as is.
pub fn resolve_token_path(path_param: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path_param {
        return path;
    }

    if let Ok(env_path) = env::var(TOKEN_PATH_ENV_VAR)
        && !env_path.is_empty()
    {
        return PathBuf::from(env_path);
    }

    match dirs::home_dir() {
        Some(home) => home.join(DEFAULT_TOKEN_RELATIVE_PATH),
        None => PathBuf::from(DEFAULT_TOKEN_RELATIVE_PATH),
    }
}

/// Resolve the device-bridge binary with priority: parameter -> env var -> default
pub fn resolve_adb_path(adb_param: Option<String>) -> String {
    if let Some(adb) = adb_param {
        return adb;
    }

    if let Ok(env_adb) = env::var(ADB_PATH_ENV_VAR)
        && !env_adb.is_empty()
    {
        return env_adb;
    }

    DEFAULT_ADB_PATH.to_string()
}
