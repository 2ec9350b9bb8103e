//! Request authentication and routing.
//!
//! # Architecture
//!
//! - `ProxyRouter`: a poem [`Endpoint`] answering every request. It checks the
//!   security token, splits the path into an endpoint name and arguments, and
//!   dispatches through a capability table keyed by (method, name).
//! - `RequestEndpoint`: one entry of the table.
//! - `DeviceRequestEndpoint` + `WithDevice`: endpoints whose first argument is
//!   a validated device id.
//!
//! Errors never leave the router as `poem::Error`: every [`ProxyError`] is
//! classified into a response here, so the standard headers added by
//! [`build_app`] are present on every answer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use poem::http::{HeaderMap, Method, StatusCode, header};
use poem::middleware::SetHeader;
use poem::{Endpoint, EndpointExt, Request, Response};
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use super::adb::{AdbExecutor, AdbShellLauncher, CommandExecutor, ShellLauncher};
use super::config::TraceTimings;
use super::endpoints::{EndTrace, Fetch, ListDevices, RunAdbCmd, StartTrace, Status};
use super::error::ProxyError;
use super::storage::{DashMapTraceStorage, TraceStorage};
use super::{TOKEN_HEADER, VERSION, VERSION_HEADER};

/// Device ids must fully match this before reaching any adb command line
static DEVICE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:\-]+$").expect("device id regex is valid"));

const BAD_REQUEST_PREAMBLE: &str = "Bad request!\nThis is Winscope ADB proxy.\n\n";
const BAD_TOKEN_BODY: &str = "Bad Winscope authorization token!\nThis is Winscope ADB proxy.\n";
const ERROR_MIME: &str = "text/txt";

/// Shared state every endpoint works against.
pub struct ProxyContext {
    /// Secret every request must present in the token header
    pub token: String,
    pub registry: Arc<dyn TraceStorage>,
    pub executor: Arc<dyn CommandExecutor>,
    pub launcher: Arc<dyn ShellLauncher>,
    pub timings: TraceTimings,
}

impl ProxyContext {
    /// Context driving the real `adb` binary with a fresh registry.
    pub fn new(token: String, adb_path: &str, timings: TraceTimings) -> Self {
        Self {
            token,
            registry: Arc::new(DashMapTraceStorage::new()),
            executor: Arc::new(AdbExecutor::new(adb_path)),
            launcher: Arc::new(AdbShellLauncher::new(adb_path)),
            timings,
        }
    }
}

/// An authenticated request, body already read.
pub struct ProxyRequest {
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ProxyRequest {
    pub fn new(headers: HeaderMap, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Parse the body as JSON, honouring the declared `Content-Length`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProxyError> {
        let declared = self
            .headers
            .get(header::CONTENT_LENGTH)
            .ok_or_else(|| ProxyError::bad_request("Missing Content-Length header"))?;
        let length = declared
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .ok_or_else(|| {
                ProxyError::bad_request(format!("Content length unreadable: {:?}", declared))
            })?;

        let body = &self.body[..length.min(self.body.len())];
        serde_json::from_slice(body)
            .map_err(|e| ProxyError::bad_request(format!("Invalid request body: {}", e)))
    }
}

/// One entry of the router's capability table.
#[async_trait]
pub trait RequestEndpoint: Send + Sync {
    /// Handle a request. `path` holds the segments after the endpoint name.
    async fn process(
        &self,
        ctx: &ProxyContext,
        request: &ProxyRequest,
        path: &[String],
    ) -> Result<Response, ProxyError>;
}

/// Endpoint addressed at one device.
#[async_trait]
pub trait DeviceRequestEndpoint: Send + Sync {
    /// Handle a request for a validated device. `path` holds the segments
    /// after the device id.
    async fn process_with_device(
        &self,
        ctx: &ProxyContext,
        request: &ProxyRequest,
        path: &[String],
        device_id: &str,
    ) -> Result<Response, ProxyError>;
}

/// Adapts a [`DeviceRequestEndpoint`] by validating the first path segment.
pub struct WithDevice<E>(pub E);

#[async_trait]
impl<E: DeviceRequestEndpoint> RequestEndpoint for WithDevice<E> {
    async fn process(
        &self,
        ctx: &ProxyContext,
        request: &ProxyRequest,
        path: &[String],
    ) -> Result<Response, ProxyError> {
        match path.split_first() {
            Some((device_id, rest)) if is_valid_device_id(device_id) => {
                self.0
                    .process_with_device(ctx, request, rest, device_id)
                    .await
            }
            _ => Err(ProxyError::bad_request("Device id not specified")),
        }
    }
}

pub fn is_valid_device_id(device_id: &str) -> bool {
    DEVICE_ID_RE.is_match(device_id)
}

/// 200 response with the given body and content type.
pub(crate) fn respond(body: impl Into<poem::Body>, mime: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .content_type(mime)
        .body(body)
}

fn error_response(err: &ProxyError) -> Response {
    let body = match err {
        ProxyError::Unauthorized => {
            warn!("Bad token");
            BAD_TOKEN_BODY.to_string()
        }
        ProxyError::BadRequest(message) => {
            warn!("Bad request: {}", message);
            format!("{}{}", BAD_REQUEST_PREAMBLE, message)
        }
        ProxyError::Adb(message) | ProxyError::Internal(message) => {
            error!("Internal error: {}", message);
            message.clone()
        }
    };
    Response::builder()
        .status(err.status())
        .content_type(ERROR_MIME)
        .body(body)
}

/// Authenticating router over the endpoint capability table.
pub struct ProxyRouter {
    ctx: Arc<ProxyContext>,
    endpoints: HashMap<(Method, String), Box<dyn RequestEndpoint>>,
}

impl ProxyRouter {
    /// Router with every proxy endpoint registered.
    pub fn new(ctx: ProxyContext) -> Self {
        let mut router = Self {
            ctx: Arc::new(ctx),
            endpoints: HashMap::new(),
        };
        router.register(Method::GET, "devices", ListDevices);
        router.register(Method::GET, "status", WithDevice(Status));
        router.register(Method::GET, "fetch", WithDevice(Fetch));
        router.register(Method::POST, "runadbcmd", WithDevice(RunAdbCmd));
        router.register(Method::POST, "starttrace", WithDevice(StartTrace));
        router.register(Method::POST, "endtrace", WithDevice(EndTrace));
        router
    }

    pub fn register(
        &mut self,
        method: Method,
        name: &str,
        endpoint: impl RequestEndpoint + 'static,
    ) {
        self.endpoints
            .insert((method, name.to_string()), Box::new(endpoint));
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(TOKEN_HEADER)
            .is_some_and(|token| token.as_bytes() == self.ctx.token.as_bytes())
    }

    async fn dispatch(
        &self,
        method: &Method,
        request: &ProxyRequest,
        path: &[String],
    ) -> Result<Response, ProxyError> {
        let (name, args) = path
            .split_first()
            .ok_or_else(|| ProxyError::bad_request("No endpoint specified"))?;

        let endpoint = self
            .endpoints
            .get(&(method.clone(), name.clone()))
            .ok_or_else(|| ProxyError::bad_request(format!("Unknown endpoint /{}/", name)))?;

        endpoint.process(&self.ctx, request, args).await
    }
}

impl Endpoint for ProxyRouter {
    type Output = Response;

    async fn call(&self, mut req: Request) -> poem::Result<Self::Output> {
        // Preflight requests cannot carry the token
        if req.method() == Method::OPTIONS {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::ALLOW, "GET,POST")
                .body("GET,POST"));
        }

        if !self.is_authorized(req.headers()) {
            return Ok(error_response(&ProxyError::Unauthorized));
        }

        let path: Vec<String> = req
            .uri()
            .path()
            .trim_matches('/')
            .split('/')
            .map(str::to_string)
            .collect();

        let body = match req.take_body().into_vec().await {
            Ok(body) => body,
            Err(e) => {
                let err = ProxyError::bad_request(format!("Unreadable request body: {}", e));
                return Ok(error_response(&err));
            }
        };
        let request = ProxyRequest::new(req.headers().clone(), body);

        let response = match self.dispatch(req.method(), &request, &path).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        };
        Ok(response)
    }
}

/// Headers added to every response, success or failure.
fn standard_headers() -> SetHeader {
    SetHeader::new()
        .overriding(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .overriding(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .overriding(header::ACCESS_CONTROL_ALLOW_METHODS, "POST, GET, OPTIONS")
        .overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            format!("{}, Content-Type, Content-Length", TOKEN_HEADER),
        )
        .overriding(header::ACCESS_CONTROL_EXPOSE_HEADERS, VERSION_HEADER)
        .overriding(VERSION_HEADER, VERSION)
}

/// Build the proxy application: router plus standard response headers.
pub fn build_app(ctx: ProxyContext) -> impl Endpoint<Output = Response> {
    ProxyRouter::new(ctx).with(standard_headers())
}
