use crate::{
    invite::{decode_secret, parse_tag},
    types::{serde_hex32, serde_option_hex32, serde_pubkey},
    utils::{now_seconds, pubkey_from_hex},
    Decryptor, Encryptor, Error, Invite, OnSession, Result, Session, Subscribe, Unsubscribe,
    INVITE_LIST_D_TAG, INVITE_LIST_KIND,
};
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp, UnsignedEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One device's standing invite: the ephemeral key responses are
/// addressed to, and the shared secret that gates them. The ephemeral
/// *secret* only exists on the device itself; it is carried by the local
/// serialized form and never by the published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    #[serde(with = "serde_pubkey")]
    pub ephemeral_public_key: PublicKey,
    #[serde(with = "serde_hex32")]
    pub shared_secret: [u8; 32],
    pub device_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(with = "serde_option_hex32", default)]
    pub ephemeral_private_key: Option<[u8; 32]>,
}

/// Tombstone for a device id. Once present, the id can never re-enter the
/// active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedDevice {
    pub device_id: String,
    pub removed_at: u64,
}

/// Owner-side device registry, published as a single replaceable event
/// (kind 10078, `d = "double-ratchet/invite-list"`). Replicas converge by
/// [`InviteList::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteList {
    #[serde(with = "serde_pubkey")]
    pub owner: PublicKey,
    devices: HashMap<String, DeviceEntry>,
    removed: Vec<RemovedDevice>,
    #[serde(default)]
    pub main_device_id: Option<String>,
    pub version: u32,
    pub created_at: u64,
}

impl InviteList {
    pub fn new(owner: PublicKey) -> Self {
        Self {
            owner,
            devices: HashMap::new(),
            removed: Vec::new(),
            main_device_id: None,
            version: 1,
            created_at: now_seconds(),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    pub fn removed(&self) -> &[RemovedDevice] {
        &self.removed
    }

    pub fn is_removed(&self, device_id: &str) -> bool {
        self.removed.iter().any(|r| r.device_id == device_id)
    }

    /// Generates a fresh ephemeral pair and shared secret for `device_id`
    /// and registers it. The secret half stays in this list instance.
    pub fn create_device_entry(
        &mut self,
        device_id: impl Into<String>,
        label: Option<String>,
    ) -> Result<DeviceEntry> {
        let device_id = device_id.into();
        if self.is_removed(&device_id) {
            return Err(Error::Invite(format!(
                "device id {device_id} has been removed"
            )));
        }

        let ephemeral_keys = Keys::generate();
        let entry = DeviceEntry {
            ephemeral_public_key: ephemeral_keys.public_key(),
            shared_secret: Keys::generate().secret_key().to_secret_bytes(),
            device_id,
            label,
            ephemeral_private_key: Some(ephemeral_keys.secret_key().to_secret_bytes()),
        };
        self.add_device(entry.clone());
        Ok(entry)
    }

    /// Registers an entry. Tombstoned ids are a no-op, as is re-adding an
    /// id that is already present. Returns whether the entry was added.
    pub fn add_device(&mut self, entry: DeviceEntry) -> bool {
        if self.is_removed(&entry.device_id) || self.devices.contains_key(&entry.device_id) {
            return false;
        }
        self.devices.insert(entry.device_id.clone(), entry);
        self.created_at = now_seconds();
        true
    }

    /// Moves a device id to the tombstone set.
    pub fn remove_device(&mut self, device_id: &str) {
        self.devices.remove(device_id);
        let now = now_seconds();
        match self.removed.iter_mut().find(|r| r.device_id == device_id) {
            Some(existing) => existing.removed_at = existing.removed_at.max(now),
            None => self.removed.push(RemovedDevice {
                device_id: device_id.to_string(),
                removed_at: now,
            }),
        }
        if self.main_device_id.as_deref() == Some(device_id) {
            self.main_device_id = None;
        }
        self.created_at = now;
    }

    /// The canonical replaceable event. The caller signs and publishes;
    /// the bus keeps only the newest per `(owner, kind, d)`.
    pub fn get_event(&self) -> Result<UnsignedEvent> {
        let mut tags = vec![
            parse_tag(&["d".to_string(), INVITE_LIST_D_TAG.to_string()])?,
            parse_tag(&["version".to_string(), self.version.to_string()])?,
        ];

        let mut devices: Vec<&DeviceEntry> = self.devices.values().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        for entry in devices {
            tags.push(parse_tag(&[
                "device".to_string(),
                hex::encode(entry.ephemeral_public_key.to_bytes()),
                hex::encode(entry.shared_secret),
                entry.device_id.clone(),
                entry.label.clone().unwrap_or_default(),
            ])?);
        }

        let mut removed: Vec<&RemovedDevice> = self.removed.iter().collect();
        removed.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        for tombstone in removed {
            tags.push(parse_tag(&[
                "removed".to_string(),
                tombstone.device_id.clone(),
                tombstone.removed_at.to_string(),
            ])?);
        }

        if let Some(main) = &self.main_device_id {
            tags.push(parse_tag(&["main-device".to_string(), main.clone()])?);
        }

        Ok(
            EventBuilder::new(Kind::from(INVITE_LIST_KIND as u16), "", tags)
                .custom_created_at(Timestamp::from(self.created_at))
                .to_unsigned_event(self.owner),
        )
    }

    /// Parses a published list. The signature must verify; malformed
    /// `device`/`removed` tags are dropped silently.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.verify().is_err() {
            return Err(Error::InvalidEvent("invalid signature".to_string()));
        }
        if event.kind.as_u16() != INVITE_LIST_KIND as u16 {
            return Err(Error::InvalidEvent("wrong kind".to_string()));
        }

        let mut has_d_tag = false;
        let mut devices = HashMap::new();
        let mut removed: Vec<RemovedDevice> = Vec::new();
        let mut main_device_id = None;
        let mut version = 1;

        for tag in event.tags.iter() {
            let values = tag.as_slice();
            match values.first().map(String::as_str) {
                Some("d") => {
                    has_d_tag |= values.get(1).map(String::as_str) == Some(INVITE_LIST_D_TAG);
                }
                Some("device") => {
                    let entry = parse_device_tag(values);
                    if let Some(entry) = entry {
                        devices.insert(entry.device_id.clone(), entry);
                    }
                }
                Some("removed") => {
                    let (Some(device_id), Some(removed_at)) = (
                        values.get(1).filter(|v| !v.is_empty()).cloned(),
                        values.get(2).and_then(|v| v.parse::<u64>().ok()),
                    ) else {
                        continue;
                    };
                    match removed.iter_mut().find(|r| r.device_id == device_id) {
                        Some(existing) => {
                            existing.removed_at = existing.removed_at.max(removed_at)
                        }
                        None => removed.push(RemovedDevice {
                            device_id,
                            removed_at,
                        }),
                    }
                }
                Some("main-device") => {
                    main_device_id = values.get(1).cloned();
                }
                Some("version") => {
                    if let Some(v) = values.get(1).and_then(|v| v.parse::<u32>().ok()) {
                        version = v;
                    }
                }
                _ => {}
            }
        }

        if !has_d_tag {
            return Err(Error::InvalidEvent("missing invite-list d tag".to_string()));
        }

        // A tombstoned id is never active.
        for tombstone in &removed {
            devices.remove(&tombstone.device_id);
        }

        Ok(Self {
            owner: event.pubkey,
            devices,
            removed,
            main_device_id,
            version,
            created_at: event.created_at.as_u64(),
        })
    }

    /// CRDT-style union of two replicas: tombstones take the max
    /// timestamp, active entries come from the fresher replica, removed
    /// ids always win. Commutative and idempotent over the observable
    /// fields.
    pub fn merge(&self, other: &InviteList) -> InviteList {
        let (newer, older) = if self.created_at >= other.created_at {
            (self, other)
        } else {
            (other, self)
        };

        let mut removed: Vec<RemovedDevice> = Vec::new();
        for tombstone in self.removed.iter().chain(other.removed.iter()) {
            match removed.iter_mut().find(|r| r.device_id == tombstone.device_id) {
                Some(existing) => {
                    existing.removed_at = existing.removed_at.max(tombstone.removed_at)
                }
                None => removed.push(tombstone.clone()),
            }
        }

        let mut devices = HashMap::new();
        for device_id in newer.devices.keys().chain(older.devices.keys()) {
            if devices.contains_key(device_id)
                || removed.iter().any(|r| &r.device_id == device_id)
            {
                continue;
            }
            let entry = newer
                .devices
                .get(device_id)
                .or_else(|| older.devices.get(device_id))
                .expect("id came from one of the maps");
            devices.insert(device_id.clone(), entry.clone());
        }

        InviteList {
            owner: newer.owner,
            devices,
            removed,
            main_device_id: newer.main_device_id.clone(),
            version: self.version.max(other.version),
            created_at: self.created_at.max(other.created_at),
        }
    }

    /// The standing invite for one device of this list.
    pub fn invite_for(&self, device_id: &str) -> Result<Invite> {
        let entry = self
            .device(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        Ok(Invite {
            inviter: self.owner,
            inviter_ephemeral_public_key: entry.ephemeral_public_key,
            shared_secret: entry.shared_secret,
            inviter_ephemeral_private_key: entry.ephemeral_private_key,
            device_id: Some(entry.device_id.clone()),
            max_uses: None,
            used_by: Vec::new(),
            created_at: self.created_at,
        })
    }

    /// Invitee-side shortcut: accept the invite of one listed device.
    pub fn accept(
        &self,
        device_id: &str,
        invitee_public_key: PublicKey,
        encryptor: &Encryptor,
        subscribe: Option<Subscribe>,
    ) -> Result<(Session, Event)> {
        self.invite_for(device_id)?
            .accept(invitee_public_key, encryptor, None, subscribe)
    }

    /// Owner-side shortcut: listen for responses addressed to one listed
    /// device. Only works where the device's ephemeral secret was
    /// retained.
    pub fn listen(
        &self,
        device_id: &str,
        decryptor: Decryptor,
        subscribe: Subscribe,
        on_session: OnSession,
    ) -> Result<Unsubscribe> {
        self.invite_for(device_id)?
            .listen(decryptor, subscribe, on_session)
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn deserialize(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn parse_device_tag(values: &[String]) -> Option<DeviceEntry> {
    let ephemeral_public_key = pubkey_from_hex(values.get(1)?).ok()?;
    let shared_secret = decode_secret(values.get(2)?).ok()?;
    let device_id = values.get(3).filter(|v| !v.is_empty())?.clone();
    let label = values.get(4).filter(|v| !v.is_empty()).cloned();
    Some(DeviceEntry {
        ephemeral_public_key,
        shared_secret,
        device_id,
        label,
        ephemeral_private_key: None,
    })
}
