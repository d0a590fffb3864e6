use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Well-known state ids written by the session
pub mod ids {
    pub const CONNECTION: &str = "info.connection";
    pub const ADDRESS: &str = "info.address";
    pub const ERROR: &str = "error";
    pub const ERROR_LOG: &str = "error_log";
    pub const SIGNED_IN: &str = "signed_in";
    pub const SIGNED_IN_USER: &str = "signed_in_user";
    pub const BROWSE_RESULT: &str = "browse.result";

    pub const SOURCES: &str = "sources";
    pub const PLAYLISTS: &str = "playlists";
    pub const PRESETS: &str = "presets";
    pub const GROUPS: &str = "groups";
    pub const PLAYERS: &str = "players";
}

/// Persisted state tree owned by the host application
///
/// Ids are dot-separated paths (`sources.1024`, `players.-1234`). The
/// session only writes; reading configuration happens before it starts.
pub trait StateStore: Send + Sync {
    fn set_state(&self, id: &str, value: Value);

    fn delete_state(&self, id: &str);
}

/// In-memory [`StateStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer that panicked cannot leave a map half-updated, so poisoning is ignored
    fn states(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.states().get(id).cloned()
    }

    /// Ids below `prefix.`, in order
    pub fn ids_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{}.", prefix);
        self.states()
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn set_state(&self, id: &str, value: Value) {
        self.states().insert(id.to_string(), value);
    }

    fn delete_state(&self, id: &str) {
        self.states().remove(id);
    }
}

/// Join path segments into a state id
pub fn state_id(prefix: &str, key: impl std::fmt::Display) -> String {
    format!("{}.{}", prefix, key)
}
