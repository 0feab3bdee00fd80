//! Durable proxy configuration store
//!
//! The pool itself lives in memory inside `ProxyLeaseManager`; this store is
//! the JSON file it is loaded from at startup and persisted to on every
//! create/update/delete, including last-check telemetry.

use std::path::PathBuf;
use tracing::{info, warn};

use super::ProxyRecord;

pub struct ProxyStore {
    path: PathBuf,
}

impl ProxyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location under the user config dir.
    pub fn open_default() -> Self {
        let path = dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("keystat")
            .join("proxies.json");
        Self::new(path)
    }

    pub fn load(&self) -> Vec<ProxyRecord> {
        if !self.path.exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Vec<ProxyRecord>>(&content) {
                Ok(records) => {
                    info!("Loaded {} proxies from {:?}", records.len(), self.path);
                    records
                }
                Err(e) => {
                    warn!("Failed to parse proxy store: {}", e);
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("Failed to read proxy store: {}", e);
                Vec::new()
            }
        }
    }

    pub fn save(&self, records: &[ProxyRecord]) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create proxy store directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(records) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&self.path, content) {
                    warn!("Failed to save proxy store: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize proxy store: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;

    #[test]
    fn test_round_trip_skips_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProxyStore::new(tmp.path().join("proxies.json"));

        let mut record = ProxyRecord::new("p1", ProxyScheme::Http, "h", 8080);
        record.in_use = 3; // transient, must not survive persistence
        record.max_concurrent = 2;
        store.save(&[record]);

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].in_use, 0);
        assert_eq!(loaded[0].max_concurrent, 2);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProxyStore::new(tmp.path().join("absent.json"));
        assert!(store.load().is_empty());
    }
}
