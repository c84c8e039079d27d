//! Shared key/value config handles.
//!
//! A [`Config`] is a cheaply cloneable handle to a flat string map. Each
//! channel exposes its live state through one (`state`, `url`, plus whatever
//! the implementation publishes); the context mirrors every named channel's
//! config under its own tree so embedders can inspect the process through a
//! single root.
//!
//! Reads take a shared lock, writes an exclusive one; handles may be read
//! from any thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Cheaply cloneable shared config map.
#[derive(Debug, Clone, Default)]
pub struct Config {
    map: Arc<RwLock<BTreeMap<String, String>>>,
}

impl Config {
    /// New empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    /// Sets a value, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.map.write().insert(key.into(), value.into());
    }

    /// Removes a value.
    pub fn del(&self, key: &str) {
        self.map.write().remove(key);
    }

    /// Snapshot of all entries in sorted key order.
    #[must_use]
    pub fn browse(&self) -> Vec<(String, String)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// JSON snapshot, for export and diagnostics.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map = self.map.read();
        serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    /// `true` when both handles refer to the same map.
    #[must_use]
    pub fn same(&self, other: &Config) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let cfg = Config::new();
        assert_eq!(cfg.get("state"), None);
        cfg.set("state", "Active");
        assert_eq!(cfg.get("state").as_deref(), Some("Active"));
        cfg.del("state");
        assert_eq!(cfg.get("state"), None);
    }

    #[test]
    fn clones_share_state() {
        let cfg = Config::new();
        let other = cfg.clone();
        other.set("url", "null://");
        assert_eq!(cfg.get("url").as_deref(), Some("null://"));
        assert!(cfg.same(&other));
        assert!(!cfg.same(&Config::new()));
    }

    #[test]
    fn browse_sorted() {
        let cfg = Config::new();
        cfg.set("b", "2");
        cfg.set("a", "1");
        let entries = cfg.browse();
        assert_eq!(
            entries,
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }

    #[test]
    fn json_snapshot() {
        let cfg = Config::new();
        cfg.set("state", "Active");
        cfg.set("url", "null://");
        assert_eq!(
            cfg.to_json(),
            serde_json::json!({"state": "Active", "url": "null://"})
        );
    }
}
