use nostr::{Event, Keys, PublicKey, SecretKey, UnsignedEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;

/// Outer (ratcheted) message events.
pub const MESSAGE_EVENT_KIND: u32 = 1060;
/// Invite advertisements, one replaceable event per device.
pub const INVITE_EVENT_KIND: u32 = 30078;
/// Envelopes produced by accepting an invite.
pub const INVITE_RESPONSE_KIND: u32 = 1059;
/// Owner-side device registry, a single replaceable event.
pub const INVITE_LIST_KIND: u32 = 10078;
/// Inner chat message events.
pub const CHAT_MESSAGE_KIND: u32 = 14;
pub const REACTION_KIND: u32 = 7;
pub const RECEIPT_KIND: u32 = 15;
pub const TYPING_KIND: u32 = 25;

/// Maximum message keys derived ahead within one receiving chain.
pub const MAX_SKIP: usize = 1000;
/// Cap on cached skipped message keys across all chains of one session.
/// Overflow evicts the oldest chain's entry wholesale.
pub const MAX_SKIP_AGGREGATE: usize = 2 * MAX_SKIP;

pub const INVITE_LIST_D_TAG: &str = "double-ratchet/invite-list";
pub(crate) const INVITE_D_PREFIX: &str = "double-ratchet/invites";

/// NIP-40-style expiration tag name.
///
/// For disappearing messages the tag goes on the *inner* event:
/// `["expiration", "<unix seconds>"]`. Purging expired messages is the
/// client's responsibility.
pub const EXPIRATION_TAG: &str = "expiration";

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// UNIX timestamp in seconds when the message should expire.
    pub expires_at: Option<u64>,
    /// Alternative to `expires_at`: seconds from now.
    pub ttl_seconds: Option<u64>,
}

/// What [`crate::Session::send`] produces: the signed outer event to
/// publish, and the inner event the peer will see after decryption.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub event: Event,
    pub inner: UnsignedEvent,
}

/// Per-message header, NIP-44-encrypted into the outer event's
/// `["header", …]` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub number: u32,
    pub previous_chain_length: u32,
    pub next_public_key: String,
}

/// A ratchet keypair. The secret half is serialized for persistence and
/// never leaves the owning side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetKeyPair {
    #[serde(with = "serde_pubkey")]
    pub public_key: PublicKey,
    #[serde(with = "serde_hex32")]
    pub private_key: [u8; 32],
}

impl RatchetKeyPair {
    pub fn generate() -> Self {
        let keys = Keys::generate();
        Self {
            public_key: keys.public_key(),
            private_key: keys.secret_key().to_secret_bytes(),
        }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Result<Self> {
        let keys = Keys::new(SecretKey::from_slice(&secret)?);
        Ok(Self {
            public_key: keys.public_key(),
            private_key: secret,
        })
    }

    pub fn secret_key(&self) -> Result<SecretKey> {
        Ok(SecretKey::from_slice(&self.private_key)?)
    }

    pub fn keys(&self) -> Result<Keys> {
        Ok(Keys::new(self.secret_key()?))
    }
}

/// Message keys derived but not yet consumed for one peer ratchet key,
/// kept so late out-of-order events still decrypt after rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedKeys {
    /// Conversation keys able to open `["header", …]` tags sent under this
    /// ratchet key, captured before our own keys rotate away.
    #[serde(with = "serde_vec_hex32")]
    pub header_keys: Vec<[u8; 32]>,

    #[serde(with = "serde_u32_map_hex32")]
    pub message_keys: HashMap<u32, [u8; 32]>,

    /// Insertion sequence; the smallest value is evicted first when the
    /// aggregate cache bound overflows.
    #[serde(default)]
    pub inserted: u64,
}

/// The authoritative per-pair ratchet state. Everything a session does is
/// a function of this plus incoming events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(with = "serde_hex32")]
    pub root_key: [u8; 32],

    #[serde(with = "serde_option_pubkey", default)]
    pub their_current_ratchet_key: Option<PublicKey>,
    #[serde(with = "serde_option_pubkey", default)]
    pub their_next_ratchet_key: Option<PublicKey>,

    pub our_current_ratchet_key: Option<RatchetKeyPair>,
    pub our_next_ratchet_key: RatchetKeyPair,

    /// Public half of the key this session was initialized with; inner
    /// events are authored under it.
    #[serde(with = "serde_pubkey")]
    pub our_identity: PublicKey,

    #[serde(with = "serde_option_hex32", default)]
    pub receiving_chain_key: Option<[u8; 32]>,
    #[serde(with = "serde_option_hex32", default)]
    pub sending_chain_key: Option<[u8; 32]>,

    pub sending_chain_message_number: u32,
    pub receiving_chain_message_number: u32,
    pub previous_sending_chain_message_count: u32,

    #[serde(with = "serde_pubkey_map")]
    pub skipped_keys: HashMap<PublicKey, SkippedKeys>,
    #[serde(default)]
    pub skipped_insert_seq: u64,
}

pub(crate) mod serde_pubkey {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pk: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(pk.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod serde_option_pubkey {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pk: &Option<PublicKey>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match pk {
            Some(p) => serializer.serialize_str(&hex::encode(p.to_bytes())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PublicKey>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                Ok(Some(
                    PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)?,
                ))
            }
            None => Ok(None),
        }
    }
}

pub(crate) mod serde_hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("expected 32 bytes"));
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(array)
    }
}

pub(crate) mod serde_option_hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_str(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                if bytes.len() != 32 {
                    return Err(serde::de::Error::custom("expected 32 bytes"));
                }
                let mut array = [0u8; 32];
                array.copy_from_slice(&bytes);
                Ok(Some(array))
            }
            None => Ok(None),
        }
    }
}

pub(crate) mod serde_vec_hex32 {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(vec: &Vec<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(vec.len()))?;
        for bytes in vec {
            seq.serialize_element(&hex::encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec: Vec<String> = Vec::deserialize(deserializer)?;
        vec.into_iter()
            .map(|s| {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                if bytes.len() != 32 {
                    return Err(serde::de::Error::custom("expected 32 bytes"));
                }
                let mut array = [0u8; 32];
                array.copy_from_slice(&bytes);
                Ok(array)
            })
            .collect()
    }
}

pub(crate) mod serde_u32_map_hex32 {
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(map: &HashMap<u32, [u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map_serializer = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            map_serializer.serialize_entry(&k.to_string(), &hex::encode(v))?;
        }
        map_serializer.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<u32, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: HashMap<String, String> = HashMap::deserialize(deserializer)?;
        map.into_iter()
            .map(|(k, v)| {
                let number = k.parse::<u32>().map_err(serde::de::Error::custom)?;
                let bytes = hex::decode(&v).map_err(serde::de::Error::custom)?;
                if bytes.len() != 32 {
                    return Err(serde::de::Error::custom("expected 32 bytes"));
                }
                let mut array = [0u8; 32];
                array.copy_from_slice(&bytes);
                Ok((number, array))
            })
            .collect()
    }
}

pub(crate) mod serde_pubkey_map {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(
        map: &HashMap<PublicKey, super::SkippedKeys>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let string_map: HashMap<String, &super::SkippedKeys> = map
            .iter()
            .map(|(k, v)| (hex::encode(k.to_bytes()), v))
            .collect();
        string_map.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<HashMap<PublicKey, super::SkippedKeys>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_map: HashMap<String, super::SkippedKeys> = HashMap::deserialize(deserializer)?;
        string_map
            .into_iter()
            .map(|(k, v)| {
                let bytes = hex::decode(&k).map_err(serde::de::Error::custom)?;
                let pk = PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)?;
                Ok((pk, v))
            })
            .collect()
    }
}
