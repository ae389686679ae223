use std::collections::HashMap;
use std::sync::RwLock;

/// Configuration collaborator: plain key lookups with defaults.
///
/// The engine re-reads values on every admission-control pass instead of
/// caching them, so changes take effect on the next tick.
pub trait Settings: Send + Sync {
    fn value(&self, key: &str) -> Option<String>;

    fn u64_value(&self, key: &str, default: u64) -> u64 {
        self.value(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn bool_value(&self, key: &str, default: bool) -> bool {
        self.value(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// In-memory settings map.
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl ToString) {
        self.values
            .write()
            .unwrap()
            .insert(key.into(), value.to_string());
    }

    pub fn unset(&self, key: &str) {
        self.values.write().unwrap().remove(key);
    }
}

impl Settings for MemorySettings {
    fn value(&self, key: &str) -> Option<String> {
        self.values.read().unwrap().get(key).cloned()
    }
}
