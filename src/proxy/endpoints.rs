//! HTTP endpoint implementations.
//!
//! | Method | Path                            | Endpoint      |
//! |--------|---------------------------------|---------------|
//! | GET    | `/devices`                      | [`ListDevices`] |
//! | GET    | `/status/{device}/{target}`     | [`Status`]      |
//! | GET    | `/fetch/{device}/{path...}`     | [`Fetch`]       |
//! | POST   | `/runadbcmd/{device}`           | [`RunAdbCmd`]   |
//! | POST   | `/starttrace/{device}`          | [`StartTrace`]  |
//! | POST   | `/endtrace/{device}`            | [`EndTrace`]    |

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use once_cell::sync::Lazy;
use poem::Response;
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::adb::CommandExecutor;
use super::error::ProxyError;
use super::router::{DeviceRequestEndpoint, ProxyContext, ProxyRequest, RequestEndpoint, respond};
use super::storage::TraceStorage;
use super::trace::{SIGNAL_HANDLER_LOG, TraceSession};
use super::types::{DeviceInfo, EndTraceRequest, RunAdbCmdRequest, StartTraceRequest};

const JSON_MIME: &str = "text/json";
const TEXT_MIME: &str = "text/plain";

/// Line length of MIME-style base64 output
const MIME_LINE_LEN: usize = 76;

/// One line of `adb devices -l`
static DEVICE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9._:\-]+)\s+(\w+)(.*model:(\w+))?")
        .expect("device listing regex is valid")
});

/// Parse `adb devices -l` output. The first line is a header.
pub fn parse_device_listing(listing: &str) -> Vec<DeviceInfo> {
    listing
        .split('\n')
        .filter(|line| !line.is_empty())
        .skip(1)
        .filter_map(|line| DEVICE_LINE_RE.captures(line))
        .map(|caps| DeviceInfo {
            id: caps[1].to_string(),
            authorized: &caps[2] != "unauthorized",
            model: caps
                .get(4)
                .map(|model| model.as_str().replace('_', " "))
                .unwrap_or_default(),
        })
        .collect()
}

/// Gzip `bytes` and base64 encode them in 76-character, newline-terminated
/// lines.
pub fn encode_file_payload(bytes: &[u8]) -> Result<String, ProxyError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;

    let encoded = STANDARD.encode(compressed);
    let mut payload = String::with_capacity(encoded.len() + encoded.len() / MIME_LINE_LEN + 1);
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(MIME_LINE_LEN));
        payload.push_str(line);
        payload.push('\n');
        rest = tail;
    }
    Ok(payload)
}

/// `GET /devices`
pub struct ListDevices;

#[async_trait]
impl RequestEndpoint for ListDevices {
    async fn process(
        &self,
        ctx: &ProxyContext,
        _request: &ProxyRequest,
        _path: &[String],
    ) -> Result<Response, ProxyError> {
        let listing = ctx.executor.run(None, "devices -l").await?;
        let devices = serde_json::to_string(&parse_device_listing(&listing))?;
        info!("Detected devices: {}", devices);
        Ok(respond(devices, JSON_MIME))
    }
}

/// `GET /status/{device}/{target}`: keep-alive poll.
pub struct Status;

#[async_trait]
impl DeviceRequestEndpoint for Status {
    async fn process_with_device(
        &self,
        ctx: &ProxyContext,
        _request: &ProxyRequest,
        path: &[String],
        device_id: &str,
    ) -> Result<Response, ProxyError> {
        let target_id = path
            .first()
            .filter(|target| !target.is_empty())
            .ok_or_else(|| ProxyError::bad_request("Target id not specified"))?;

        let alive = match ctx.registry.get(device_id, target_id) {
            Some(session) => {
                session.reset_keep_alive();
                session.is_alive()
            }
            None => {
                debug!("No {} trace registered for {}", target_id, device_id);
                false
            }
        };
        Ok(respond(alive.to_string(), TEXT_MIME))
    }
}

/// `GET /fetch/{device}/{path...}`
pub struct Fetch;

#[async_trait]
impl DeviceRequestEndpoint for Fetch {
    async fn process_with_device(
        &self,
        ctx: &ProxyContext,
        _request: &ProxyRequest,
        path: &[String],
        device_id: &str,
    ) -> Result<Response, ProxyError> {
        let file_path = path.join("/");
        debug!("Fetching file {} from {}", file_path, device_id);

        let mut files = HashMap::new();
        let params = format!("exec-out su root cat {}", file_path);
        match ctx.executor.run_raw(device_id, &params).await {
            Ok(bytes) => {
                files.insert(file_path, encode_file_payload(&bytes)?);
            }
            Err(e) => warn!("Unable to fetch file {} - {}", file_path, e),
        }

        Ok(respond(serde_json::to_string(&files)?, JSON_MIME))
    }
}

/// `POST /runadbcmd/{device}`: passthrough command.
pub struct RunAdbCmd;

#[async_trait]
impl DeviceRequestEndpoint for RunAdbCmd {
    async fn process_with_device(
        &self,
        ctx: &ProxyContext,
        request: &ProxyRequest,
        _path: &[String],
        device_id: &str,
    ) -> Result<Response, ProxyError> {
        let request: RunAdbCmdRequest = request.json()?;
        let output = ctx.executor.run(Some(device_id), &request.cmd).await?;
        Ok(respond(serde_json::to_string(&output)?, TEXT_MIME))
    }
}

/// `POST /starttrace/{device}`
pub struct StartTrace;

#[async_trait]
impl DeviceRequestEndpoint for StartTrace {
    async fn process_with_device(
        &self,
        ctx: &ProxyContext,
        request: &ProxyRequest,
        _path: &[String],
        device_id: &str,
    ) -> Result<Response, ProxyError> {
        let request: StartTraceRequest = request.json()?;
        let session = TraceSession::start(
            device_id,
            &request,
            ctx.launcher.as_ref(),
            ctx.executor.clone(),
            ctx.timings,
        )?;

        if let Some(previous) = ctx.registry.insert(session) {
            warn!(
                "Replaced {} trace on {} while it was {}",
                previous.target_id(),
                device_id,
                previous.state()
            );
        }
        Ok(respond("", JSON_MIME))
    }
}

/// `POST /endtrace/{device}`: stop a trace and report its errors.
pub struct EndTrace;

#[async_trait]
impl DeviceRequestEndpoint for EndTrace {
    async fn process_with_device(
        &self,
        ctx: &ProxyContext,
        request: &ProxyRequest,
        _path: &[String],
        device_id: &str,
    ) -> Result<Response, ProxyError> {
        if !ctx.registry.contains_device(device_id) {
            return Err(ProxyError::bad_request(format!(
                "No trace in progress for {}",
                device_id
            )));
        }

        let request: EndTraceRequest = request.json()?;
        let target_id = request.target_id.as_str();
        let session = ctx.registry.get(device_id, target_id).ok_or_else(|| {
            ProxyError::bad_request(format!(
                "No {} trace in progress for {}",
                target_id, device_id
            ))
        })?;

        // Finishes even if the client disconnects midway
        let finish = tokio::spawn(finish_trace(
            session,
            Arc::clone(&ctx.executor),
            Arc::clone(&ctx.registry),
        ));
        let errors = finish
            .await
            .map_err(|e| ProxyError::Internal(format!("End trace task failed: {}", e)))?;

        Ok(respond(serde_json::to_string(&errors)?, TEXT_MIME))
    }
}

/// Stop `session`, collect its problems, clean the device and unregister it.
async fn finish_trace(
    session: Arc<TraceSession>,
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<dyn TraceStorage>,
) -> Vec<String> {
    let device_id = session.device_id();
    let target_id = session.target_id();
    let mut errors = Vec::new();

    if session.is_alive() {
        session.end_trace().await;
    }

    let signal_handler_log = match executor
        .run(
            Some(device_id),
            &format!("shell su root cat {}", SIGNAL_HANDLER_LOG),
        )
        .await
    {
        Ok(log) => log,
        Err(e) => {
            warn!("Unable to read signal handler log from {}: {}", device_id, e);
            errors.push(format!("Unable to read signal handler log: {}", e));
            String::new()
        }
    };
    let outcome = session.outcome(&signal_handler_log).await;

    if outcome.timed_out {
        let message = format!("Trace {} timed out during cleanup", target_id);
        error!("{}", message);
        errors.push(message);
    }
    if !outcome.success {
        error!("Error ending trace {} on the device", target_id);
        let stderr = session
            .output()
            .await
            .map(|output| output.stderr_text())
            .unwrap_or_default();
        errors.push(format!(
            "Error ending trace {} on the device: {}",
            target_id, stderr
        ));
    }
    debug!("### Output ###\n{}", outcome.log);

    if let Err(e) = executor
        .run(
            Some(device_id),
            &format!("shell su root rm {}", session.status_file()),
        )
        .await
    {
        warn!("Unable to remove {} on {}: {}", session.status_file(), device_id, e);
        errors.push(format!(
            "Unable to remove status file {}: {}",
            session.status_file(),
            e
        ));
    }
    registry.remove(device_id, target_id);

    errors
}
