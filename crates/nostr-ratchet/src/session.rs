use crate::{
    build_filter, ratchet,
    utils::{jittered_now, now_seconds, resolve_expiration_seconds},
    Error, EventCallback, Result, SendOptions, SentMessage, SessionState, Subscribe, Unsubscribe,
    CHAT_MESSAGE_KIND, EXPIRATION_TAG, MESSAGE_EVENT_KIND, REACTION_KIND, RECEIPT_KIND,
    TYPING_KIND,
};
use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receives every successfully decrypted inner event, in bus delivery
/// order.
pub type MessageCallback = Box<dyn FnMut(UnsignedEvent) + Send>;

/// Counters for inbound events the session swallowed instead of
/// surfacing. Relays broadcast garbage and sessions get probed by events
/// they don't own, so these are diagnostics, not errors.
#[derive(Debug, Default)]
pub struct DecryptStats {
    crypto_failures: AtomicU64,
    malformed_events: AtomicU64,
}

impl DecryptStats {
    pub fn crypto_failures(&self) -> u64 {
        self.crypto_failures.load(Ordering::Relaxed)
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed_events.load(Ordering::Relaxed)
    }

    fn record(&self, error: &Error) {
        if error.is_crypto_failure() {
            self.crypto_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.malformed_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Everything the inbound path needs, clonable into bus callbacks.
#[derive(Clone)]
struct SessionCtx {
    state: Arc<Mutex<SessionState>>,
    subscribe: Option<Subscribe>,
    current_unsubscribe: Arc<Mutex<Option<Unsubscribe>>>,
    next_unsubscribe: Arc<Mutex<Option<Unsubscribe>>>,
    handlers: Arc<Mutex<Vec<MessageCallback>>>,
    stats: Arc<DecryptStats>,
    name: String,
}

impl SessionCtx {
    /// Full inbound transition: decrypt on a scratch state, commit and
    /// swap subscriptions on success, fan out to handlers afterwards.
    /// Failures are counted and swallowed.
    fn process(&self, event: &Event, dispatch: bool) -> Option<UnsignedEvent> {
        let mut state = self.state.lock().unwrap();
        let inner = match ratchet::decrypt_event_with_state(&state, event) {
            Ok(Some((inner, updated))) => {
                let ratcheted = updated.their_next_ratchet_key != state.their_next_ratchet_key;
                let their_current = updated.their_current_ratchet_key;
                let their_next = updated.their_next_ratchet_key;
                *state = updated;
                if ratcheted {
                    // Same lock as the transition; the swap and the state
                    // change are observed together.
                    self.open_subscriptions(their_current, their_next);
                }
                inner
            }
            Ok(None) => return None,
            Err(e) => {
                self.stats.record(&e);
                tracing::debug!(session = %self.name, error = %e, "dropping undecryptable event");
                return None;
            }
        };
        drop(state);

        if dispatch {
            let mut handlers = self.handlers.lock().unwrap();
            for handler in handlers.iter_mut() {
                handler(inner.clone());
            }
        }
        Some(inner)
    }

    /// Replaces both subscriptions with fresh ones for the given peer
    /// ratchet keys. Old handles are consumed, which cancels them.
    fn open_subscriptions(&self, current: Option<PublicKey>, next: Option<PublicKey>) {
        let Some(subscribe) = &self.subscribe else {
            return;
        };

        let slots = [
            (current, &self.current_unsubscribe),
            (next, &self.next_unsubscribe),
        ];
        for (key, slot) in slots {
            if let Some(unsubscribe) = slot.lock().unwrap().take() {
                unsubscribe();
            }
            let Some(key) = key else { continue };
            let filter = build_filter()
                .kinds(vec![MESSAGE_EVENT_KIND as u64])
                .authors(vec![key])
                .build();
            let ctx = self.clone();
            let callback: EventCallback = Box::new(move |event| {
                ctx.process(&event, true);
            });
            *slot.lock().unwrap() = Some(subscribe(filter, callback));
        }
    }

    fn close(&self) {
        if let Some(unsubscribe) = self.current_unsubscribe.lock().unwrap().take() {
            unsubscribe();
        }
        if let Some(unsubscribe) = self.next_unsubscribe.lock().unwrap().take() {
            unsubscribe();
        }
        self.handlers.lock().unwrap().clear();
    }
}

/// A pairwise Double Ratchet session bound to the event bus.
///
/// Owns at most two live subscriptions (peer's current and next ratchet
/// key); a committed DH ratchet step swaps both. All state sits behind one
/// mutex held across the whole transition, so sessions can be shared with
/// a multi-threaded bus while staying single-writer.
pub struct Session {
    ctx: SessionCtx,
    pub name: String,
}

impl Session {
    /// Derives the initial state from a shared secret and the peer's
    /// ratchet public key. The initiator can send immediately; the
    /// responder's chains come up on its first received message, and it
    /// starts listening for that message right away when a `subscribe`
    /// capability is given.
    pub fn init(
        subscribe: Option<Subscribe>,
        their_ratchet_key: PublicKey,
        our_secret: [u8; 32],
        is_initiator: bool,
        shared_secret: [u8; 32],
        name: Option<String>,
    ) -> Result<Self> {
        let state = ratchet::init_state(their_ratchet_key, our_secret, is_initiator, shared_secret)?;
        Ok(Self::from_state(state, name, subscribe))
    }

    /// Rebinds a previously serialized state to a (possibly absent) bus
    /// capability and resumes its subscriptions.
    pub fn from_state(state: SessionState, name: Option<String>, subscribe: Option<Subscribe>) -> Self {
        let session = Self {
            ctx: SessionCtx {
                state: Arc::new(Mutex::new(state)),
                subscribe,
                current_unsubscribe: Arc::new(Mutex::new(None)),
                next_unsubscribe: Arc::new(Mutex::new(None)),
                handlers: Arc::new(Mutex::new(Vec::new())),
                stats: Arc::new(DecryptStats::default()),
                name: name.clone().unwrap_or_else(|| "session".to_string()),
            },
            name: name.unwrap_or_else(|| "session".to_string()),
        };
        session.subscribe_to_messages();
        session
    }

    /// (Re)opens the author-filtered subscriptions for the peer's current
    /// and next ratchet keys. No-op without a subscribe capability.
    pub fn subscribe_to_messages(&self) {
        let state = self.ctx.state.lock().unwrap();
        let current = state.their_current_ratchet_key;
        let next = state.their_next_ratchet_key;
        self.ctx.open_subscriptions(current, next);
    }

    /// A copy of the current ratchet state, e.g. for persistence.
    pub fn snapshot(&self) -> SessionState {
        self.ctx.state.lock().unwrap().clone()
    }

    pub fn can_send(&self) -> bool {
        let state = self.ctx.state.lock().unwrap();
        state.our_current_ratchet_key.is_some() && state.sending_chain_key.is_some()
    }

    pub fn stats(&self) -> Arc<DecryptStats> {
        self.ctx.stats.clone()
    }

    /// Registers a handler for decrypted inner events delivered through
    /// the bus subscriptions.
    pub fn on_event(&self, handler: MessageCallback) {
        self.ctx.handlers.lock().unwrap().push(handler);
    }

    pub fn send(&self, text: impl Into<String>) -> Result<SentMessage> {
        let inner = EventBuilder::new(Kind::from(CHAT_MESSAGE_KIND as u16), text.into(), [])
            .to_unsigned_event(self.identity());
        self.send_event(inner)
    }

    /// Reaction to a previous message (`message_id`), e.g. "👍".
    pub fn send_reaction(&self, message_id: &str, emoji: &str) -> Result<SentMessage> {
        let tag = Tag::parse(&["e".to_string(), message_id.to_string()])
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        let inner = EventBuilder::new(Kind::from(REACTION_KIND as u16), emoji, [tag])
            .to_unsigned_event(self.identity());
        self.send_event(inner)
    }

    /// Delivery/read receipt: `receipt_type` is "delivered" or "seen".
    pub fn send_receipt(&self, receipt_type: &str, message_ids: &[&str]) -> Result<SentMessage> {
        let mut builder = EventBuilder::new(Kind::from(RECEIPT_KIND as u16), receipt_type, []);
        for id in message_ids {
            builder = builder.add_tags([Tag::parse(&["e".to_string(), id.to_string()])
                .map_err(|e| Error::InvalidEvent(e.to_string()))?]);
        }
        self.send_event(builder.to_unsigned_event(self.identity()))
    }

    pub fn send_typing(&self) -> Result<SentMessage> {
        let inner = EventBuilder::new(Kind::from(TYPING_KIND as u16), "typing", [])
            .to_unsigned_event(self.identity());
        self.send_event(inner)
    }

    pub fn send_event(&self, event: UnsignedEvent) -> Result<SentMessage> {
        self.send_event_with(event, &SendOptions::default())
    }

    /// Ratchets the sending chain once and wraps `event` into a signed
    /// outer envelope. The envelope's author is the current ratchet key
    /// and its timestamp is jittered up to two days into the past; the
    /// inner event keeps the real time.
    pub fn send_event_with(
        &self,
        mut event: UnsignedEvent,
        options: &SendOptions,
    ) -> Result<SentMessage> {
        let now = now_seconds();
        let expiration = resolve_expiration_seconds(options, now)?;

        let mut state = self.ctx.state.lock().unwrap();
        if state.our_current_ratchet_key.is_none() || state.sending_chain_key.is_none() {
            return Err(Error::SessionNotReady);
        }

        event.created_at = Timestamp::from(now);
        event.pubkey = state.our_identity;

        let has_ms_tag = event
            .tags
            .iter()
            .any(|t| t.as_slice().first().map(String::as_str) == Some("ms"));

        if !has_ms_tag || expiration.is_some() {
            let mut builder = EventBuilder::new(event.kind, &event.content, []);
            for tag in event.tags.iter() {
                builder = builder.add_tags([tag.clone()]);
            }
            if !has_ms_tag {
                builder = builder.add_tags([Tag::parse(&[
                    "ms".to_string(),
                    (now * 1000).to_string(),
                ])
                .map_err(|e| Error::InvalidEvent(e.to_string()))?]);
            }
            if let Some(expires_at) = expiration {
                builder = builder.add_tags([Tag::parse(&[
                    EXPIRATION_TAG.to_string(),
                    expires_at.to_string(),
                ])
                .map_err(|e| Error::InvalidEvent(e.to_string()))?]);
            }
            event = builder
                .custom_created_at(event.created_at)
                .to_unsigned_event(event.pubkey);
        }

        // Fields were mutated; the id must match the final content.
        event.id = None;
        event.ensure_id();

        let inner_json = serde_json::to_string(&event)?;
        let (header, ciphertext) = ratchet::ratchet_encrypt(&mut state, &inner_json)?;

        let our_current = state
            .our_current_ratchet_key
            .clone()
            .expect("checked above");
        let their_next = state.their_next_ratchet_key.ok_or(Error::SessionNotReady)?;
        drop(state);

        let encrypted_header = nip44::encrypt(
            &our_current.secret_key()?,
            &their_next,
            serde_json::to_string(&header)?,
            Version::V2,
        )?;

        let header_tag = Tag::parse(&["header".to_string(), encrypted_header])
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;

        let outer = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND as u16), ciphertext, [header_tag])
            .custom_created_at(Timestamp::from(jittered_now()))
            .to_unsigned_event(our_current.public_key);

        let signed = outer
            .sign(&our_current.keys()?)
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;

        Ok(SentMessage {
            event: signed,
            inner: event,
        })
    }

    /// Decrypts one event against this session, committing the ratchet
    /// transition (and subscription swap) only on success. Returns `None`
    /// for events that aren't ours or fail to decrypt; see [`DecryptStats`].
    pub fn decrypt_event(&self, event: &Event) -> Option<UnsignedEvent> {
        self.ctx.process(event, false)
    }

    /// Pure offline variant: no subscriptions touched, the caller keeps
    /// both the decrypted inner event and the updated state.
    pub fn decrypt_event_with_state(
        state: &SessionState,
        event: &Event,
    ) -> Result<Option<(UnsignedEvent, SessionState)>> {
        ratchet::decrypt_event_with_state(state, event)
    }

    /// Cancels all subscriptions and drops the registered handlers.
    pub fn close(&self) {
        self.ctx.close();
    }

    fn identity(&self) -> PublicKey {
        self.ctx.state.lock().unwrap().our_identity
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
