//! Non-volatile persistence contract — §6. CMOS/flash devices own their own
//! byte layout; this crate only gives them somewhere durable to put it,
//! keyed by `"<machine.internal_name>.<device.internal_name>"` so the same
//! device class on two different machine profiles never collides.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NvrError {
    #[error("nvr io error for {key}: {source}")]
    Io { key: String, #[source] source: std::io::Error },
}

/// Storage backend for device NVRAM/CMOS/flash blobs. A host application may
/// swap in something other than [`FileNvrStore`] (e.g. an in-memory store
/// for tests, or a cloud-synced one); the core only depends on this trait.
pub trait NvrStore {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn save(&self, key: &str, data: &[u8]) -> Result<(), NvrError>;
}

/// One flat file per key under a directory, named after the key with a
/// `.nvr` suffix.
pub struct FileNvrStore {
    dir: PathBuf,
}

impl FileNvrStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.nvr"))
    }
}

impl NvrStore for FileNvrStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.path_for(key)).ok()
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<(), NvrError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(&path, data).map_err(|source| NvrError::Io { key: key.to_string(), source })
    }
}

/// Builds the persistence key for one device's NVRAM blob.
pub fn nvr_key(machine_internal_name: &str, device_internal_name: &str) -> String {
    format!("{machine_internal_name}.{device_internal_name}")
}

/// Convenience wrapper so callers don't have to be a real filesystem path
/// type; used by tests and by `pcbus-cli`.
pub fn file_store(dir: &Path) -> FileNvrStore {
    FileNvrStore::new(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNvrStore::new(dir.path());
        let key = nvr_key("ibm-5150", "cmos");
        assert_eq!(store.load(&key), None);

        store.save(&key, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.load(&key), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn keys_are_namespaced_by_machine_so_same_device_class_does_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNvrStore::new(dir.path());
        store.save(&nvr_key("machine-a", "cmos"), &[0xAA]).unwrap();
        store.save(&nvr_key("machine-b", "cmos"), &[0xBB]).unwrap();
        assert_eq!(store.load(&nvr_key("machine-a", "cmos")), Some(vec![0xAA]));
        assert_eq!(store.load(&nvr_key("machine-b", "cmos")), Some(vec![0xBB]));
    }
}
