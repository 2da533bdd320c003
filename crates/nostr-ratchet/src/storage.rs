use crate::{Error, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Minimal key-value contract the persistence layer is written against.
/// Values are JSON strings; `list` enumerates keys by prefix.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Ordered in-memory store. Keys live in a sorted map, so `list` is a
/// range scan and always comes back in key order. Reads share the lock,
/// writes take it exclusively.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Storage("empty storage key".to_string()));
        }
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

fn poisoned() -> Error {
    Error::Storage("storage lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values() {
        let storage = InMemoryStorage::new();

        assert!(storage.get("missing").unwrap().is_none());

        storage.put("v1/user/abc", "{}".to_string()).unwrap();
        assert_eq!(storage.get("v1/user/abc").unwrap(), Some("{}".to_string()));
        assert_eq!(storage.len(), 1);

        storage.del("v1/user/abc").unwrap();
        assert!(storage.get("v1/user/abc").unwrap().is_none());
        storage.del("v1/user/abc").unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn rejects_empty_keys() {
        let storage = InMemoryStorage::new();
        assert!(storage.put("", "value".to_string()).is_err());
    }

    #[test]
    fn list_is_a_sorted_prefix_scan() {
        let storage = InMemoryStorage::new();
        storage.put("v1/user/bob", "2".to_string()).unwrap();
        storage.put("v1/user/alice", "1".to_string()).unwrap();
        storage.put("v1/invite/carol", "3".to_string()).unwrap();
        storage.put("v2/user/dave", "4".to_string()).unwrap();

        assert_eq!(
            storage.list("v1/user/").unwrap(),
            vec!["v1/user/alice", "v1/user/bob"]
        );
        assert_eq!(storage.list("").unwrap().len(), 4);
        assert!(storage.list("v3/").unwrap().is_empty());
    }
}
