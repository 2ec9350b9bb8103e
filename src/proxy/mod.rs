//! ADB proxy module driving Winscope trace sessions on attached devices.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and its mapping onto HTTP status codes
//! - `token`: Persistent proxy security token
//! - `adb`: Device-bridge command execution and remote shell launching
//! - `process`: Handle over a spawned remote shell process
//! - `watchdog`: Keep-alive timer for trace sessions
//! - `trace`: Trace session state machine
//! - `storage`: Session registry
//! - `router`: Request authentication and routing
//! - `endpoints`: HTTP endpoint implementations
//! - `types`: Serializable request and response types

pub mod adb;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod process;
pub mod router;
pub mod storage;
pub mod token;
pub mod trace;
pub mod types;
pub(crate) mod watchdog;

#[cfg(test)]
pub(crate) mod test_support;

pub use router::{ProxyContext, build_app};

/// Proxy version reported to the client, kept in sync with the Winscope client.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying the proxy security token on every request.
pub const TOKEN_HEADER: &str = "Winscope-Token";

/// Header carrying [`VERSION`] on every response.
pub const VERSION_HEADER: &str = "Winscope-Proxy-Version";
