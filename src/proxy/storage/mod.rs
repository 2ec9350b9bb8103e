//! Storage abstraction for trace sessions.
//!
//! The registry is a trait so endpoints can be exercised against a fresh
//! instance per test, while the server shares one `DashMap`-backed instance.

mod trace;
mod traits;

pub use trace::DashMapTraceStorage;
pub use traits::TraceStorage;
