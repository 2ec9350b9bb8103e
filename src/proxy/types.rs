//! Serializable request and response types for the proxy endpoints.
//!
//! Field names follow the Winscope client's camelCase wire format.

use serde::{Deserialize, Serialize};

/// A device reported by `adb devices -l`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    /// False only when adb reports the device as `unauthorized`
    pub authorized: bool,
    /// Model name with underscores replaced by spaces, empty if unknown
    pub model: String,
}

/// Body of `POST /starttrace/{device}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTraceRequest {
    pub target_id: String,
    /// Shell text run once the monitored script is up
    pub start_cmd: String,
    /// Shell text run by the script's termination handler
    pub stop_cmd: String,
}

/// Body of `POST /endtrace/{device}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndTraceRequest {
    pub target_id: String,
}

/// Body of `POST /runadbcmd/{device}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAdbCmdRequest {
    pub cmd: String,
}

/// What ending a trace session produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceOutcome {
    /// Whether cleanup timed out (forced kill or completion marker never seen)
    pub timed_out: bool,
    /// Whether the trace finished cleanly on the device
    pub success: bool,
    /// Shell stdout, shell stderr and signal handler log, one section each
    pub log: String,
}
