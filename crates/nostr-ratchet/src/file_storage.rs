use crate::{Error, Result, StorageAdapter};
use std::fs;
use std::path::PathBuf;

/// One file per key under a root directory. Path separators inside keys
/// are escaped so `list` can reconstruct the original key.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("failed to create directory: {e}")))?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", escape_key(key)))
    }
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25")
        .replace('/', "%2F")
        .replace('\\', "%5C")
        .replace(':', "%3A")
}

fn unescape_key(escaped: &str) -> String {
    escaped
        .replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%3A", ":")
        .replace("%25", "%")
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_to_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("failed to read file: {e}"))),
        }
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        fs::write(self.key_to_path(key), value)
            .map_err(|e| Error::Storage(format!("failed to write file: {e}")))
    }

    fn del(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to delete file: {e}"))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| Error::Storage(format!("failed to read directory: {e}")))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("failed to read dir entry: {e}")))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            let Some(escaped) = file_name.strip_suffix(".json") else {
                continue;
            };
            let key = unescape_key(escaped);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_values() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        assert!(storage.get("missing").unwrap().is_none());

        storage.put("v1/user/abc", "{}".to_string()).unwrap();
        assert_eq!(storage.get("v1/user/abc").unwrap(), Some("{}".to_string()));

        storage.del("v1/user/abc").unwrap();
        assert!(storage.get("v1/user/abc").unwrap().is_none());
        // Deleting again is fine.
        storage.del("v1/user/abc").unwrap();
    }

    #[test]
    fn list_reconstructs_keys_with_separators() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        storage.put("v1/user/alice", "1".to_string()).unwrap();
        storage.put("v1/user/bob", "2".to_string()).unwrap();
        storage.put("v1/invite/carol", "3".to_string()).unwrap();

        let mut keys = storage.list("v1/user/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["v1/user/alice", "v1/user/bob"]);

        assert_eq!(storage.list("").unwrap().len(), 3);
    }
}
