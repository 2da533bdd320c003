use crate::{
    utils::pubkey_from_hex, Result, StorageAdapter, StoredUserRecord, Subscribe, UserRecord,
};
use nostr::PublicKey;
use std::collections::HashMap;
use std::sync::Arc;

/// Key-layout version segment; bump when the stored shape changes.
const STORAGE_VERSION: &str = "v1";

/// In-memory map of peer identity → [`UserRecord`], persisted through a
/// [`StorageAdapter`] under `"<version>/user/<hex pubkey>"`.
pub struct UserRecordStore {
    storage: Arc<dyn StorageAdapter>,
    version: String,
    records: HashMap<PublicKey, UserRecord>,
}

impl UserRecordStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::with_version(storage, STORAGE_VERSION)
    }

    pub fn with_version(storage: Arc<dyn StorageAdapter>, version: impl Into<String>) -> Self {
        Self {
            storage,
            version: version.into(),
            records: HashMap::new(),
        }
    }

    fn user_key(&self, public_key: &PublicKey) -> String {
        format!(
            "{}/user/{}",
            self.version,
            hex::encode(public_key.to_bytes())
        )
    }

    fn user_prefix(&self) -> String {
        format!("{}/user/", self.version)
    }

    pub fn get(&self, public_key: &PublicKey) -> Option<&UserRecord> {
        self.records.get(public_key)
    }

    pub fn get_mut(&mut self, public_key: &PublicKey) -> Option<&mut UserRecord> {
        self.records.get_mut(public_key)
    }

    pub fn get_or_create(&mut self, public_key: PublicKey) -> &mut UserRecord {
        self.records
            .entry(public_key)
            .or_insert_with(|| UserRecord::new(public_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, &UserRecord)> {
        self.records.iter()
    }

    /// Persists one record.
    pub fn save(&self, public_key: &PublicKey) -> Result<()> {
        let Some(record) = self.records.get(public_key) else {
            return Ok(());
        };
        let json = serde_json::to_string(&record.to_stored())?;
        self.storage.put(&self.user_key(public_key), json)
    }

    /// Loads one record from storage, rebinding its sessions to
    /// `subscribe`. Returns whether anything was found.
    pub fn load(&mut self, public_key: PublicKey, subscribe: Option<Subscribe>) -> Result<bool> {
        let Some(json) = self.storage.get(&self.user_key(&public_key))? else {
            return Ok(false);
        };
        let stored: StoredUserRecord = serde_json::from_str(&json)?;
        let record = UserRecord::from_stored(stored, subscribe)?;
        if let Some(mut previous) = self.records.insert(public_key, record) {
            previous.close();
        }
        Ok(true)
    }

    /// Loads every record under this store's prefix. Corrupt entries are
    /// skipped with a warning rather than failing the whole load.
    pub fn load_all(&mut self, subscribe: Option<Subscribe>) -> Result<usize> {
        let prefix = self.user_prefix();
        let mut loaded = 0;
        for key in self.storage.list(&prefix)? {
            let Some(hex_pubkey) = key.strip_prefix(&prefix) else {
                continue;
            };
            let public_key = match pubkey_from_hex(hex_pubkey) {
                Ok(pk) => pk,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unparseable user key");
                    continue;
                }
            };
            match self.load(public_key, subscribe.clone()) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping corrupt user record");
                }
            }
        }
        Ok(loaded)
    }

    /// Drops a record from memory and storage, closing its sessions.
    pub fn delete(&mut self, public_key: &PublicKey) -> Result<()> {
        if let Some(mut record) = self.records.remove(public_key) {
            record.close();
        }
        self.storage.del(&self.user_key(public_key))
    }
}
