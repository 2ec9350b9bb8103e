//! Storage trait definition for trace session management.

use std::sync::Arc;

use crate::proxy::trace::TraceSession;

/// Trait for trace session storage operations.
///
/// Sessions are keyed by device id, then by target id. At most one session is
/// registered per (device, target) pair.
///
/// Implementations must be thread-safe (`Send + Sync`): request handlers for
/// different devices access the registry concurrently.
pub trait TraceStorage: Send + Sync {
    /// Register a session under its own device and target ids, returning the
    /// session it replaced, if any.
    fn insert(&self, session: Arc<TraceSession>) -> Option<Arc<TraceSession>>;

    /// Get the session for a (device, target) pair.
    fn get(&self, device_id: &str, target_id: &str) -> Option<Arc<TraceSession>>;

    /// Remove the session for a (device, target) pair. A device left without
    /// sessions is forgotten.
    fn remove(&self, device_id: &str, target_id: &str) -> Option<Arc<TraceSession>>;

    /// Check if any session is registered for a device.
    fn contains_device(&self, device_id: &str) -> bool;

    /// Count sessions registered for a device.
    fn count_by_device(&self, device_id: &str) -> usize;

    /// Get all device ids with at least one session.
    fn device_ids(&self) -> Vec<String>;
}
