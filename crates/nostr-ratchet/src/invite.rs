use crate::{
    build_filter,
    utils::{jittered_now, now_seconds, pubkey_from_hex},
    Error, EventCallback, Result, Session, Subscribe, Unsubscribe, INVITE_EVENT_KIND,
    INVITE_RESPONSE_KIND,
};
use base64::Engine;
use nostr::nips::nip44::{self, v2::ConversationKey, Version};
use nostr::{EventBuilder, Keys, Kind, PublicKey, SecretKey, Tag, Timestamp, UnsignedEvent};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::types::INVITE_D_PREFIX;

/// Identity-layer encryption capability for [`Invite::accept`]: either the
/// invitee's raw identity secret, or a custom closure when the key lives
/// elsewhere (hardware signer, remote signer, …).
#[derive(Clone)]
pub enum Encryptor {
    Key([u8; 32]),
    Custom(Arc<dyn Fn(&str, &PublicKey) -> Result<String> + Send + Sync>),
}

impl Encryptor {
    pub fn encrypt(&self, plaintext: &str, peer: &PublicKey) -> Result<String> {
        match self {
            Encryptor::Key(secret) => Ok(nip44::encrypt(
                &SecretKey::from_slice(secret)?,
                peer,
                plaintext,
                Version::V2,
            )?),
            Encryptor::Custom(f) => f(plaintext, peer),
        }
    }
}

impl From<[u8; 32]> for Encryptor {
    fn from(secret: [u8; 32]) -> Self {
        Encryptor::Key(secret)
    }
}

/// Identity-layer decryption capability for [`Invite::listen`], mirroring
/// [`Encryptor`].
#[derive(Clone)]
pub enum Decryptor {
    Key([u8; 32]),
    Custom(Arc<dyn Fn(&str, &PublicKey) -> Result<String> + Send + Sync>),
}

impl Decryptor {
    pub fn decrypt(&self, ciphertext: &str, peer: &PublicKey) -> Result<String> {
        match self {
            Decryptor::Key(secret) => Ok(nip44::decrypt(
                &SecretKey::from_slice(secret)?,
                peer,
                ciphertext,
            )?),
            Decryptor::Custom(f) => f(ciphertext, peer),
        }
    }
}

impl From<[u8; 32]> for Decryptor {
    fn from(secret: [u8; 32]) -> Self {
        Decryptor::Key(secret)
    }
}

/// Called by [`Invite::listen`] for every accepted response: the
/// responder-side session, the invitee's identity key, and the invitee's
/// device id when it announced one.
pub type OnSession = Box<dyn FnMut(Session, PublicKey, Option<String>) + Send>;

/// An (ephemeral keypair, shared secret) bundle advertised by a potential
/// inviter. The ephemeral secret exists only on the device that created
/// the invite; everyone else sees the public bundle via event or URL.
#[derive(Clone)]
pub struct Invite {
    pub inviter: PublicKey,
    pub inviter_ephemeral_public_key: PublicKey,
    pub shared_secret: [u8; 32],
    pub inviter_ephemeral_private_key: Option<[u8; 32]>,
    pub device_id: Option<String>,
    pub max_uses: Option<usize>,
    pub used_by: Vec<PublicKey>,
    pub created_at: u64,
}

/// What [`Invite::listen`] hands to its callback.
pub struct InviteResponse {
    pub session: Session,
    pub invitee_identity: PublicKey,
    pub device_id: Option<String>,
}

impl Invite {
    pub fn create_new(
        inviter: PublicKey,
        device_id: Option<String>,
        max_uses: Option<usize>,
    ) -> Self {
        let ephemeral_keys = Keys::generate();
        Self {
            inviter,
            inviter_ephemeral_public_key: ephemeral_keys.public_key(),
            shared_secret: Keys::generate().secret_key().to_secret_bytes(),
            inviter_ephemeral_private_key: Some(ephemeral_keys.secret_key().to_secret_bytes()),
            device_id,
            max_uses,
            used_by: Vec::new(),
            created_at: now_seconds(),
        }
    }

    /// Shareable URL. All fields live in the fragment so they never reach
    /// the server hosting `root`.
    pub fn get_url(&self, root: &str) -> String {
        let data = serde_json::json!({
            "inviter": hex::encode(self.inviter.to_bytes()),
            "ephemeralKey": hex::encode(self.inviter_ephemeral_public_key.to_bytes()),
            "sharedSecret": hex::encode(self.shared_secret),
        });
        format!("{}#{}", root, urlencoding::encode(&data.to_string()))
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let fragment = url
            .split('#')
            .nth(1)
            .ok_or_else(|| Error::Invite("no fragment in URL".to_string()))?;
        let decoded = urlencoding::decode(fragment).map_err(|e| Error::Invite(e.to_string()))?;
        let data: serde_json::Value = serde_json::from_str(&decoded)?;

        let inviter = pubkey_from_hex(
            data["inviter"]
                .as_str()
                .ok_or_else(|| Error::Invite("missing inviter".to_string()))?,
        )?;
        let ephemeral_key = pubkey_from_hex(
            data["ephemeralKey"]
                .as_str()
                .ok_or_else(|| Error::Invite("missing ephemeralKey".to_string()))?,
        )?;
        let shared_secret = decode_secret(
            data["sharedSecret"]
                .as_str()
                .ok_or_else(|| Error::Invite("missing sharedSecret".to_string()))?,
        )?;

        Ok(Self {
            inviter,
            inviter_ephemeral_public_key: ephemeral_key,
            shared_secret,
            inviter_ephemeral_private_key: None,
            device_id: None,
            max_uses: None,
            used_by: Vec::new(),
            created_at: 0,
        })
    }

    /// The public invite as a replaceable event, addressed by device id.
    /// The caller signs and publishes it.
    pub fn get_event(&self) -> Result<UnsignedEvent> {
        let device_id = self.device_id.as_ref().ok_or(Error::DeviceIdRequired)?;

        let tags = vec![
            parse_tag(&[
                "ephemeralKey".to_string(),
                hex::encode(self.inviter_ephemeral_public_key.to_bytes()),
            ])?,
            parse_tag(&["sharedSecret".to_string(), hex::encode(self.shared_secret)])?,
            parse_tag(&["d".to_string(), format!("{INVITE_D_PREFIX}/{device_id}")])?,
            parse_tag(&["l".to_string(), INVITE_D_PREFIX.to_string()])?,
        ];

        Ok(
            EventBuilder::new(Kind::from(INVITE_EVENT_KIND as u16), "", tags)
                .custom_created_at(Timestamp::from(self.created_at))
                .to_unsigned_event(self.inviter),
        )
    }

    pub fn from_event(event: &nostr::Event) -> Result<Self> {
        let ephemeral_key = tag_value(event, "ephemeralKey")
            .ok_or_else(|| Error::Invite("missing ephemeralKey tag".to_string()))?;
        let shared_secret_hex = tag_value(event, "sharedSecret")
            .ok_or_else(|| Error::Invite("missing sharedSecret tag".to_string()))?;
        let device_id = tag_value(event, "d")
            .and_then(|d| d.strip_prefix(&format!("{INVITE_D_PREFIX}/")).map(String::from));

        Ok(Self {
            inviter: event.pubkey,
            inviter_ephemeral_public_key: pubkey_from_hex(&ephemeral_key)?,
            shared_secret: decode_secret(&shared_secret_hex)?,
            inviter_ephemeral_private_key: None,
            device_id,
            max_uses: None,
            used_by: Vec::new(),
            created_at: event.created_at.as_u64(),
        })
    }

    /// Invitee side of the handshake.
    ///
    /// Generates a fresh session key, wraps it in the two-layer response
    /// (identity DH inside, shared secret in the middle, ephemeral
    /// envelope outside, posted from a one-shot keypair) and returns the
    /// initiator-side session together with the envelope to publish.
    pub fn accept(
        &self,
        invitee_public_key: PublicKey,
        encryptor: &Encryptor,
        device_id: Option<String>,
        subscribe: Option<Subscribe>,
    ) -> Result<(Session, nostr::Event)> {
        let session_keys = Keys::generate();

        let session = Session::init(
            subscribe,
            self.inviter_ephemeral_public_key,
            session_keys.secret_key().to_secret_bytes(),
            true,
            self.shared_secret,
            None,
        )?;

        let mut payload = serde_json::Map::new();
        payload.insert(
            "sessionKey".to_string(),
            serde_json::Value::String(hex::encode(session_keys.public_key().to_bytes())),
        );
        if let Some(device_id) = device_id {
            payload.insert("deviceId".to_string(), serde_json::Value::String(device_id));
        }
        let payload = serde_json::Value::Object(payload);

        // Inner layer: only the holder of the invitee identity key can
        // produce this, which is what authenticates the response.
        let dh_encrypted = encryptor.encrypt(&payload.to_string(), &self.inviter)?;

        // Middle layer under the shared secret from the invite link.
        let conversation_key = ConversationKey::new(self.shared_secret);
        let encrypted = nip44::v2::encrypt_to_bytes(&conversation_key, &dh_encrypted)?;
        let inner_content = base64::engine::general_purpose::STANDARD.encode(encrypted);

        let inner_event = serde_json::json!({
            "pubkey": hex::encode(invitee_public_key.to_bytes()),
            "content": inner_content,
            "created_at": now_seconds(),
        });

        // Outer envelope from a one-shot keypair: nothing observable links
        // it to the invitee.
        let envelope_keys = Keys::generate();
        let envelope_content = nip44::encrypt(
            envelope_keys.secret_key(),
            &self.inviter_ephemeral_public_key,
            inner_event.to_string(),
            Version::V2,
        )?;

        let p_tag = parse_tag(&[
            "p".to_string(),
            hex::encode(self.inviter_ephemeral_public_key.to_bytes()),
        ])?;
        let envelope = EventBuilder::new(
            Kind::from(INVITE_RESPONSE_KIND as u16),
            envelope_content,
            [p_tag],
        )
        .custom_created_at(Timestamp::from(jittered_now()))
        .to_unsigned_event(envelope_keys.public_key())
        .sign(&envelope_keys)
        .map_err(|e| Error::InvalidEvent(e.to_string()))?;

        Ok((session, envelope))
    }

    /// Inviter side: unwraps one response envelope into a responder
    /// session. Fails when this copy of the invite never held the
    /// ephemeral secret.
    pub fn process_response(
        &self,
        event: &nostr::Event,
        decryptor: &Decryptor,
        subscribe: Option<Subscribe>,
    ) -> Result<InviteResponse> {
        let ephemeral_secret = self
            .inviter_ephemeral_private_key
            .ok_or(Error::EphemeralKeyUnavailable)?;

        let envelope_plain = nip44::decrypt(
            &SecretKey::from_slice(&ephemeral_secret)?,
            &event.pubkey,
            &event.content,
        )?;
        let inner_event: serde_json::Value = serde_json::from_str(&envelope_plain)?;

        let invitee_identity = pubkey_from_hex(
            inner_event["pubkey"]
                .as_str()
                .ok_or_else(|| Error::Invite("missing pubkey".to_string()))?,
        )?;
        let inner_content = inner_event["content"]
            .as_str()
            .ok_or_else(|| Error::Invite("missing content".to_string()))?;

        let conversation_key = ConversationKey::new(self.shared_secret);
        let middle = base64::engine::general_purpose::STANDARD
            .decode(inner_content)
            .map_err(|e| Error::Decryption(e.to_string()))?;
        let dh_ciphertext =
            String::from_utf8(nip44::v2::decrypt_to_bytes(&conversation_key, &middle)?)
                .map_err(|e| Error::Decryption(e.to_string()))?;

        let payload_plain = decryptor.decrypt(&dh_ciphertext, &invitee_identity)?;

        // Older clients sent the bare session key instead of a JSON
        // payload.
        let (session_key, device_id) = match serde_json::from_str::<serde_json::Value>(
            &payload_plain,
        ) {
            Ok(payload) if payload.is_object() => (
                pubkey_from_hex(
                    payload["sessionKey"]
                        .as_str()
                        .ok_or_else(|| Error::Invite("missing sessionKey".to_string()))?,
                )?,
                payload["deviceId"].as_str().map(String::from),
            ),
            _ => (pubkey_from_hex(payload_plain.trim())?, None),
        };

        let session = Session::init(
            subscribe,
            session_key,
            ephemeral_secret,
            false,
            self.shared_secret,
            Some(event.id.to_string()),
        )?;

        Ok(InviteResponse {
            session,
            invitee_identity,
            device_id,
        })
    }

    /// Subscribes for responses to this invite and drives `on_session`
    /// for each valid one. Duplicate envelopes are ignored, and when
    /// `max_uses` is set, responses past the bound (from identities not
    /// already counted) are dropped silently.
    pub fn listen(
        &self,
        decryptor: Decryptor,
        subscribe: Subscribe,
        on_session: OnSession,
    ) -> Result<Unsubscribe> {
        if self.inviter_ephemeral_private_key.is_none() {
            return Err(Error::EphemeralKeyUnavailable);
        }

        let filter = build_filter()
            .kinds(vec![INVITE_RESPONSE_KIND as u64])
            .pubkeys(vec![self.inviter_ephemeral_public_key])
            .build();

        let invite = self.clone();
        let subscribe_for_sessions = subscribe.clone();
        let on_session = Arc::new(Mutex::new(on_session));
        let used_by = Arc::new(Mutex::new(self.used_by.clone()));
        let seen_events = Arc::new(Mutex::new(HashSet::new()));
        let max_uses = self.max_uses;

        let callback: EventCallback = Box::new(move |event| {
            if !seen_events.lock().unwrap().insert(event.id) {
                return;
            }

            let response = match invite.process_response(
                &event,
                &decryptor,
                Some(subscribe_for_sessions.clone()),
            ) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring invite response");
                    return;
                }
            };

            if let Some(max) = max_uses {
                let mut used = used_by.lock().unwrap();
                if !used.contains(&response.invitee_identity) {
                    if used.len() >= max {
                        tracing::debug!(
                            invitee = %response.invitee_identity,
                            "invite exhausted, dropping response"
                        );
                        response.session.close();
                        return;
                    }
                    used.push(response.invitee_identity);
                }
            }

            (on_session.lock().unwrap())(
                response.session,
                response.invitee_identity,
                response.device_id,
            );
        });

        Ok(subscribe(filter, callback))
    }

    /// Local persisted form; retains the ephemeral secret and use
    /// tracking, unlike the public event/URL forms.
    pub fn serialize(&self) -> String {
        serde_json::json!({
            "inviter": hex::encode(self.inviter.to_bytes()),
            "inviterEphemeralPublicKey": hex::encode(self.inviter_ephemeral_public_key.to_bytes()),
            "sharedSecret": hex::encode(self.shared_secret),
            "inviterEphemeralPrivateKey": self.inviter_ephemeral_private_key.map(hex::encode),
            "deviceId": self.device_id,
            "maxUses": self.max_uses,
            "usedBy": self
                .used_by
                .iter()
                .map(|pk| hex::encode(pk.to_bytes()))
                .collect::<Vec<_>>(),
            "createdAt": self.created_at,
        })
        .to_string()
    }

    pub fn deserialize(json: &str) -> Result<Self> {
        let data: serde_json::Value = serde_json::from_str(json)?;

        let inviter_ephemeral_private_key = match data["inviterEphemeralPrivateKey"].as_str() {
            Some(hex_str) => Some(decode_secret(hex_str)?),
            None => None,
        };

        let used_by = data["usedBy"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| pubkey_from_hex(s).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            inviter: pubkey_from_hex(
                data["inviter"]
                    .as_str()
                    .ok_or_else(|| Error::Invite("missing inviter".to_string()))?,
            )?,
            inviter_ephemeral_public_key: pubkey_from_hex(
                data["inviterEphemeralPublicKey"]
                    .as_str()
                    .ok_or_else(|| Error::Invite("missing ephemeral key".to_string()))?,
            )?,
            shared_secret: decode_secret(
                data["sharedSecret"]
                    .as_str()
                    .ok_or_else(|| Error::Invite("missing sharedSecret".to_string()))?,
            )?,
            inviter_ephemeral_private_key,
            device_id: data["deviceId"].as_str().map(String::from),
            max_uses: data["maxUses"].as_u64().map(|u| u as usize),
            used_by,
            created_at: data["createdAt"].as_u64().unwrap_or(0),
        })
    }
}

pub(crate) fn parse_tag(values: &[String]) -> Result<Tag> {
    Tag::parse(values).map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub(crate) fn tag_value(event: &nostr::Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some(name) {
            values.get(1).cloned()
        } else {
            None
        }
    })
}

pub(crate) fn decode_secret(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::Invite("secret must be 32 bytes".to_string()));
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&bytes);
    Ok(secret)
}
