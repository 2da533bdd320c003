use crate::{types::serde_pubkey, utils::now_seconds, Result, Session, SessionState, Subscribe};
use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How many superseded sessions a device keeps around for late messages.
const MAX_INACTIVE_SESSIONS: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub name: String,
    pub state: SessionState,
}

impl StoredSession {
    pub fn of(session: &Session) -> Self {
        Self {
            name: session.name.clone(),
            state: session.snapshot(),
        }
    }

    pub fn into_session(self, subscribe: Option<Subscribe>) -> Session {
        Session::from_state(self.state, Some(self.name), subscribe)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDeviceRecord {
    pub device_id: String,
    pub active_session: Option<StoredSession>,
    pub inactive_sessions: Vec<StoredSession>,
    pub created_at: u64,
    #[serde(default)]
    pub stale_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUserRecord {
    #[serde(with = "serde_pubkey")]
    pub public_key: PublicKey,
    pub devices: Vec<StoredDeviceRecord>,
}

/// The sessions we hold toward one device of a peer. At most one active
/// session plus one superseded session that may still receive stragglers.
#[derive(Debug)]
pub struct DeviceRecord {
    pub device_id: String,
    pub active_session: Option<Session>,
    pub inactive_sessions: Vec<Session>,
    pub created_at: u64,
    pub stale_at: Option<u64>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            active_session: None,
            inactive_sessions: Vec::new(),
            created_at: now_seconds(),
            stale_at: None,
        }
    }

    /// Installs `next` as the active session. A session with the same
    /// logical name replaces the active one in place; anything else
    /// demotes the current active into the inactive slot, dropping the
    /// oldest beyond the cap.
    pub fn rotate_session(&mut self, next: Session) {
        match &self.active_session {
            None => {
                self.active_session = Some(next);
            }
            Some(active) if active.name == next.name => {
                if let Some(replaced) = self.active_session.replace(next) {
                    replaced.close();
                }
            }
            Some(_) => {
                let demoted = self
                    .active_session
                    .replace(next)
                    .expect("active checked above");
                self.inactive_sessions.insert(0, demoted);
                while self.inactive_sessions.len() > MAX_INACTIVE_SESSIONS {
                    if let Some(dropped) = self.inactive_sessions.pop() {
                        dropped.close();
                    }
                }
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale_at.is_some()
    }

    pub fn mark_stale(&mut self) {
        self.stale_at = Some(now_seconds());
    }

    pub fn close(&mut self) {
        if let Some(session) = self.active_session.take() {
            session.close();
        }
        for session in self.inactive_sessions.drain(..) {
            session.close();
        }
    }

    fn to_stored(&self) -> StoredDeviceRecord {
        StoredDeviceRecord {
            device_id: self.device_id.clone(),
            active_session: self.active_session.as_ref().map(StoredSession::of),
            inactive_sessions: self.inactive_sessions.iter().map(StoredSession::of).collect(),
            created_at: self.created_at,
            stale_at: self.stale_at,
        }
    }

    fn from_stored(stored: StoredDeviceRecord, subscribe: Option<Subscribe>) -> Self {
        Self {
            device_id: stored.device_id,
            active_session: stored
                .active_session
                .map(|s| s.into_session(subscribe.clone())),
            inactive_sessions: stored
                .inactive_sessions
                .into_iter()
                .map(|s| s.into_session(subscribe.clone()))
                .collect(),
            created_at: stored.created_at,
            stale_at: stored.stale_at,
        }
    }
}

/// All device records we hold toward one peer identity.
#[derive(Debug)]
pub struct UserRecord {
    pub public_key: PublicKey,
    pub devices: HashMap<String, DeviceRecord>,
}

impl UserRecord {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            devices: HashMap::new(),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    pub fn device_mut(&mut self, device_id: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(device_id)
    }

    /// Routes a fresh session to the right device record, creating the
    /// record on first contact.
    pub fn rotate_session(&mut self, device_id: &str, session: Session) {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord::new(device_id))
            .rotate_session(session);
    }

    /// Active sessions across non-stale devices, sendable ones first.
    pub fn active_sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self
            .devices
            .values()
            .filter(|d| !d.is_stale())
            .filter_map(|d| d.active_session.as_ref())
            .collect();
        sessions.sort_by_key(|s| !s.can_send());
        sessions
    }

    /// Every session, active and inactive, across non-stale devices.
    pub fn all_sessions(&self) -> Vec<&Session> {
        let mut sessions = Vec::new();
        for device in self.devices.values().filter(|d| !d.is_stale()) {
            if let Some(active) = &device.active_session {
                sessions.push(active);
            }
            sessions.extend(device.inactive_sessions.iter());
        }
        sessions
    }

    pub fn close(&mut self) {
        for device in self.devices.values_mut() {
            device.close();
        }
        self.devices.clear();
    }

    pub fn to_stored(&self) -> StoredUserRecord {
        let mut devices: Vec<StoredDeviceRecord> =
            self.devices.values().map(DeviceRecord::to_stored).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        StoredUserRecord {
            public_key: self.public_key,
            devices,
        }
    }

    /// Rebuilds the record, rebinding every session to the given bus
    /// capability.
    pub fn from_stored(stored: StoredUserRecord, subscribe: Option<Subscribe>) -> Result<Self> {
        let mut devices = HashMap::new();
        for device in stored.devices {
            devices.insert(
                device.device_id.clone(),
                DeviceRecord::from_stored(device, subscribe.clone()),
            );
        }
        Ok(Self {
            public_key: stored.public_key,
            devices,
        })
    }
}
