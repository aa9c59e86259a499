//! Durable storage for address lists.
//!
//! Each list is a JSON array of address strings. Saves are atomic: the new
//! content is written to a sibling temp file, synced to disk and renamed
//! over the old one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while saving an address list.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The list could not be serialized.
    #[error("failed to serialize address list: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The list could not be written to disk.
    #[error("failed to write address list {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Backing storage for one address set.
///
/// `load` never fails: a missing or unreadable list is treated as empty.
/// `save` durably replaces the previous list.
pub trait AddressStore: Send + Sync {
    /// Returns the last saved list, or an empty list.
    fn load(&self) -> Vec<String>;

    /// Replaces the stored list with `addresses`.
    fn save(&self, addresses: &[String]) -> Result<(), StoreError>;
}

/// An [`AddressStore`] backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonAddressStore {
    path: PathBuf,
}

impl JsonAddressStore {
    /// Creates a store persisting to `path`. Nothing is read until `load`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Write { path, source }
}

impl AddressStore for JsonAddressStore {
    fn load(&self) -> Vec<String> {
        if !self.path.exists() {
            tracing::debug!("Address list {:?} not found, starting empty", self.path);
            return Vec::new();
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Failed to read address list {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<String>>(&contents) {
            Ok(addresses) => {
                tracing::debug!(
                    "Loaded {} addresses from {:?}",
                    addresses.len(),
                    self.path
                );
                addresses
            }
            Err(e) => {
                tracing::warn!("Ignoring corrupt address list {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    fn save(&self, addresses: &[String]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_error(parent))?;
            }
        }

        let contents = serde_json::to_string_pretty(addresses)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path).map_err(write_error(&temp_path))?;
        file.write_all(contents.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(write_error(&temp_path))?;
        drop(file);
        fs::rename(&temp_path, &self.path).map_err(write_error(&self.path))?;

        tracing::debug!("Saved {} addresses to {:?}", addresses.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAddressStore::new(temp_dir.path().join("allowed.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAddressStore::new(temp_dir.path().join("nested").join("allowed.json"));

        let addresses = vec!["10.0.0.1".to_string(), "fe80::1".to_string()];
        store.save(&addresses).unwrap();

        assert_eq!(store.load(), addresses);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_save_replaces_previous_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAddressStore::new(temp_dir.path().join("blocked.json"));

        store
            .save(&["10.0.0.1".to_string(), "10.0.0.2".to_string()])
            .unwrap();
        store.save(&["10.0.0.3".to_string()]).unwrap();

        assert_eq!(store.load(), vec!["10.0.0.3".to_string()]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_stale_temp_file_is_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAddressStore::new(temp_dir.path().join("blocked.json"));
        fs::write(store.path().with_extension("json.tmp"), "left over from a crash, much longer").unwrap();

        store.save(&["10.0.0.4".to_string()]).unwrap();

        assert_eq!(store.load(), vec!["10.0.0.4".to_string()]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_file_is_a_plain_json_array() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blocked.json");
        let store = JsonAddressStore::new(&path);

        store.save(&["192.168.1.7".to_string()]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!(["192.168.1.7"]));
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blocked.json");
        fs::write(&path, "{not json").unwrap();

        assert!(JsonAddressStore::new(&path).load().is_empty());
    }

    #[test]
    fn test_wrong_shape_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blocked.json");
        fs::write(&path, r#"{"addresses": ["10.0.0.1"]}"#).unwrap();

        assert!(JsonAddressStore::new(&path).load().is_empty());
    }

    #[test]
    fn test_save_into_unwritable_location_fails() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let store = JsonAddressStore::new(blocker.join("allowed.json"));
        let err = store.save(&["10.0.0.1".to_string()]).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
    }
}
