//! DashMap-based trace session storage implementation.
//!
//! Provides lock-free concurrent access across devices. Sessions of one device
//! live in a plain `HashMap` guarded by that device's shard entry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::proxy::trace::TraceSession;

use super::traits::TraceStorage;

/// DashMap-based implementation of `TraceStorage`.
///
/// device_id -> target_id -> session
pub struct DashMapTraceStorage {
    sessions: DashMap<String, HashMap<String, Arc<TraceSession>>>,
}

impl DashMapTraceStorage {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl Default for DashMapTraceStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceStorage for DashMapTraceStorage {
    fn insert(&self, session: Arc<TraceSession>) -> Option<Arc<TraceSession>> {
        self.sessions
            .entry(session.device_id().to_string())
            .or_default()
            .insert(session.target_id().to_string(), session)
    }

    fn get(&self, device_id: &str, target_id: &str) -> Option<Arc<TraceSession>> {
        self.sessions
            .get(device_id)
            .and_then(|targets| targets.get(target_id).cloned())
    }

    fn remove(&self, device_id: &str, target_id: &str) -> Option<Arc<TraceSession>> {
        let removed = self
            .sessions
            .get_mut(device_id)
            .and_then(|mut targets| targets.remove(target_id));
        self.sessions
            .remove_if(device_id, |_, targets| targets.is_empty());
        removed
    }

    fn contains_device(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    fn count_by_device(&self, device_id: &str) -> usize {
        self.sessions
            .get(device_id)
            .map(|targets| targets.len())
            .unwrap_or(0)
    }

    fn device_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}
