//! Double Ratchet state transitions.
//!
//! Everything here operates on [`SessionState`] values and performs no
//! I/O. Inbound transitions run on a scratch copy of the state and only
//! hand back the updated copy on success, so a failing event of any kind
//! leaves the caller's state untouched.

use crate::{
    utils::{kdf, pubkey_from_hex},
    Error, Header, RatchetKeyPair, Result, SessionState, SkippedKeys, MAX_SKIP,
    MAX_SKIP_AGGREGATE, MESSAGE_EVENT_KIND,
};
use base64::Engine;
use nostr::nips::nip44::{self, v2::ConversationKey};
use nostr::{Event, PublicKey, UnsignedEvent};
use std::collections::HashMap;

/// Salt for the symmetric chain step `chain_key -> (chain_key', message_key)`.
const CHAIN_STEP_SALT: [u8; 1] = [1];

pub(crate) fn init_state(
    their_ratchet_key: PublicKey,
    our_secret: [u8; 32],
    is_initiator: bool,
    shared_secret: [u8; 32],
) -> Result<SessionState> {
    let our_keys = RatchetKeyPair::from_secret_bytes(our_secret)?;
    let our_identity = our_keys.public_key;

    let (root_key, sending_chain_key, our_current_ratchet_key, our_next_ratchet_key);

    if is_initiator {
        // The supplied key becomes the first header key, so the first
        // outbound event is predictable from the invite. The sending chain
        // is keyed to the *next* pair, which the first header announces.
        let next = RatchetKeyPair::generate();
        let conversation_key =
            ConversationKey::derive(&next.secret_key()?, &their_ratchet_key);
        let outputs = kdf(&shared_secret, conversation_key.as_bytes(), 2);
        root_key = outputs[0];
        sending_chain_key = Some(outputs[1]);
        our_current_ratchet_key = Some(our_keys);
        our_next_ratchet_key = next;
    } else {
        root_key = shared_secret;
        sending_chain_key = None;
        our_current_ratchet_key = None;
        our_next_ratchet_key = our_keys;
    }

    Ok(SessionState {
        root_key,
        // Learned from traffic, never set here.
        their_current_ratchet_key: None,
        their_next_ratchet_key: Some(their_ratchet_key),
        our_current_ratchet_key,
        our_next_ratchet_key,
        our_identity,
        receiving_chain_key: None,
        sending_chain_key,
        sending_chain_message_number: 0,
        receiving_chain_message_number: 0,
        previous_sending_chain_message_count: 0,
        skipped_keys: HashMap::new(),
        skipped_insert_seq: 0,
    })
}

/// One sending-chain step: advances the chain, returns the header for the
/// message and the base64 ciphertext of `plaintext`.
pub(crate) fn ratchet_encrypt(
    state: &mut SessionState,
    plaintext: &str,
) -> Result<(Header, String)> {
    let sending_chain_key = state.sending_chain_key.ok_or(Error::SessionNotReady)?;

    let outputs = kdf(&sending_chain_key, &CHAIN_STEP_SALT, 2);
    state.sending_chain_key = Some(outputs[0]);
    let message_key = outputs[1];

    let header = Header {
        number: state.sending_chain_message_number,
        previous_chain_length: state.previous_sending_chain_message_count,
        next_public_key: hex::encode(state.our_next_ratchet_key.public_key.to_bytes()),
    };

    state.sending_chain_message_number += 1;

    let conversation_key = ConversationKey::new(message_key);
    let encrypted = nip44::v2::encrypt_to_bytes(&conversation_key, plaintext)?;
    let ciphertext = base64::engine::general_purpose::STANDARD.encode(encrypted);
    Ok((header, ciphertext))
}

/// Pure inbound transition. `Ok(None)` means the event is not addressed to
/// this state (wrong kind, or a sender key the state has never seen) and
/// no work was done. Errors mean the event looked like ours but failed to
/// decrypt or parse; the input state is unaffected either way.
pub fn decrypt_event_with_state(
    state: &SessionState,
    event: &Event,
) -> Result<Option<(UnsignedEvent, SessionState)>> {
    let sender = event.pubkey;
    let relevant = event.kind.as_u16() == MESSAGE_EVENT_KIND as u16
        && (state.their_current_ratchet_key == Some(sender)
            || state.their_next_ratchet_key == Some(sender)
            || state.skipped_keys.contains_key(&sender));
    if !relevant {
        return Ok(None);
    }

    let mut updated = state.clone();
    let inner = apply_incoming(&mut updated, event)?;
    Ok(Some((inner, updated)))
}

fn apply_incoming(state: &mut SessionState, event: &Event) -> Result<UnsignedEvent> {
    let sender = event.pubkey;
    let encrypted_header = header_payload(event).ok_or(Error::InvalidHeader)?;

    let matches_current = state.their_current_ratchet_key == Some(sender);
    let matches_next = state.their_next_ratchet_key == Some(sender);

    if !matches_current && !matches_next {
        // A chain we already rotated away from; only the cache can help.
        let plaintext = decrypt_from_skipped_chain(state, &sender, &encrypted_header, &event.content)?;
        return parse_inner(&plaintext);
    }

    let (header, should_ratchet) = decrypt_header(state, &encrypted_header, &sender)?;

    if should_ratchet {
        // The header only opened with our next key: the peer started a new
        // chain. Park whatever is left of the old one first.
        if state.receiving_chain_key.is_some() {
            if let Some(previous_sender) = state.their_current_ratchet_key {
                skip_message_keys(state, header.previous_chain_length, &previous_sender)?;
            }
        }
        state.their_current_ratchet_key = Some(sender);
        state.their_next_ratchet_key = Some(pubkey_from_hex(&header.next_public_key)?);
        ratchet_step(state)?;
        tracing::debug!(
            sender = %sender,
            previous_chain_length = header.previous_chain_length,
            "DH ratchet step"
        );
    }

    let plaintext = ratchet_decrypt(state, &header, &event.content, &sender)?;
    parse_inner(&plaintext)
}

/// DH ratchet step: new receiving chain against the announced peer key,
/// key rotation on our side, then a new root and sending chain.
fn ratchet_step(state: &mut SessionState) -> Result<()> {
    state.previous_sending_chain_message_count = state.sending_chain_message_number;
    state.sending_chain_message_number = 0;
    state.receiving_chain_message_number = 0;

    let their_next = state
        .their_next_ratchet_key
        .ok_or(Error::SessionNotReady)?;

    let receiving_dh =
        ConversationKey::derive(&state.our_next_ratchet_key.secret_key()?, &their_next);
    let outputs = kdf(&state.root_key, receiving_dh.as_bytes(), 2);
    state.receiving_chain_key = Some(outputs[1]);

    state.our_current_ratchet_key = Some(state.our_next_ratchet_key.clone());
    state.our_next_ratchet_key = RatchetKeyPair::generate();

    let sending_dh =
        ConversationKey::derive(&state.our_next_ratchet_key.secret_key()?, &their_next);
    let next_outputs = kdf(&outputs[0], sending_dh.as_bytes(), 2);
    state.root_key = next_outputs[0];
    state.sending_chain_key = Some(next_outputs[1]);

    Ok(())
}

/// Derives and caches receiving-chain keys up to (exclusive) `until`,
/// keyed by the sender's ratchet key, enforcing both the per-chain and the
/// aggregate cache bounds.
fn skip_message_keys(state: &mut SessionState, until: u32, sender: &PublicKey) -> Result<()> {
    if until <= state.receiving_chain_message_number {
        return Ok(());
    }

    let gap = (until - state.receiving_chain_message_number) as usize;
    if gap > MAX_SKIP {
        return Err(Error::TooManySkippedMessages);
    }

    enforce_aggregate_bound(state, gap);

    if !state.skipped_keys.contains_key(sender) {
        // Capture the conversation keys able to open this chain's headers
        // now; our own keys may rotate away before stragglers arrive.
        let mut header_keys = Vec::with_capacity(2);
        if let Some(current) = &state.our_current_ratchet_key {
            header_keys.push(
                ConversationKey::derive(&current.secret_key()?, sender)
                    .as_bytes()
                    .try_into()
                    .expect("conversation key is 32 bytes"),
            );
        }
        header_keys.push(
            ConversationKey::derive(&state.our_next_ratchet_key.secret_key()?, sender)
                .as_bytes()
                .try_into()
                .expect("conversation key is 32 bytes"),
        );

        let entry = SkippedKeys {
            header_keys,
            message_keys: HashMap::new(),
            inserted: state.skipped_insert_seq,
        };
        state.skipped_insert_seq += 1;
        state.skipped_keys.insert(*sender, entry);
    }

    let entry = state
        .skipped_keys
        .get_mut(sender)
        .expect("entry inserted above");
    if entry.message_keys.len() + gap > MAX_SKIP {
        return Err(Error::TooManySkippedMessages);
    }

    while state.receiving_chain_message_number < until {
        let receiving_chain_key = state.receiving_chain_key.ok_or(Error::SessionNotReady)?;
        let outputs = kdf(&receiving_chain_key, &CHAIN_STEP_SALT, 2);
        state.receiving_chain_key = Some(outputs[0]);
        entry
            .message_keys
            .insert(state.receiving_chain_message_number, outputs[1]);
        state.receiving_chain_message_number += 1;
    }

    Ok(())
}

/// Evicts whole chains, oldest first, until `incoming` more keys fit under
/// [`MAX_SKIP_AGGREGATE`].
fn enforce_aggregate_bound(state: &mut SessionState, incoming: usize) {
    loop {
        let total: usize = state
            .skipped_keys
            .values()
            .map(|entry| entry.message_keys.len())
            .sum();
        if total + incoming <= MAX_SKIP_AGGREGATE || state.skipped_keys.is_empty() {
            return;
        }
        let oldest = state
            .skipped_keys
            .iter()
            .min_by_key(|(_, entry)| entry.inserted)
            .map(|(key, _)| *key)
            .expect("non-empty map");
        let evicted = state.skipped_keys.remove(&oldest);
        tracing::warn!(
            ratchet_key = %oldest,
            dropped_keys = evicted.map(|e| e.message_keys.len()).unwrap_or(0),
            "skipped-key cache overflow, evicting oldest chain"
        );
    }
}

fn ratchet_decrypt(
    state: &mut SessionState,
    header: &Header,
    ciphertext: &str,
    sender: &PublicKey,
) -> Result<String> {
    if let Some(plaintext) = try_skipped_message_keys(state, header.number, ciphertext, sender)? {
        return Ok(plaintext);
    }

    if state.receiving_chain_key.is_none() {
        return Err(Error::SessionNotReady);
    }

    skip_message_keys(state, header.number, sender)?;

    let receiving_chain_key = state
        .receiving_chain_key
        .expect("checked above, skip never clears it");
    let outputs = kdf(&receiving_chain_key, &CHAIN_STEP_SALT, 2);
    state.receiving_chain_key = Some(outputs[0]);
    state.receiving_chain_message_number += 1;

    decrypt_with_message_key(&outputs[1], ciphertext)
}

/// Consumes a cached key for `(sender, number)` if one exists. Used keys
/// are wiped immediately; an emptied chain entry is dropped with them.
fn try_skipped_message_keys(
    state: &mut SessionState,
    number: u32,
    ciphertext: &str,
    sender: &PublicKey,
) -> Result<Option<String>> {
    let Some(entry) = state.skipped_keys.get_mut(sender) else {
        return Ok(None);
    };
    let Some(message_key) = entry.message_keys.remove(&number) else {
        return Ok(None);
    };

    let plaintext = decrypt_with_message_key(&message_key, ciphertext)?;

    if entry.message_keys.is_empty() {
        state.skipped_keys.remove(sender);
    }
    Ok(Some(plaintext))
}

/// Path for senders that match neither current nor next key: the header
/// must open with a stored header key, and the message key must be cached.
fn decrypt_from_skipped_chain(
    state: &mut SessionState,
    sender: &PublicKey,
    encrypted_header: &str,
    ciphertext: &str,
) -> Result<String> {
    let header = {
        let entry = state
            .skipped_keys
            .get(sender)
            .expect("dispatch checked membership");
        decrypt_header_with_stored_keys(&entry.header_keys, encrypted_header)?
    };

    try_skipped_message_keys(state, header.number, ciphertext, sender)?.ok_or_else(|| {
        Error::Decryption(format!("no skipped message key for number {}", header.number))
    })
}

/// Opens the encrypted header. Our current key first (same chain), then
/// our next key (success there signals the start of a new chain), then
/// any header keys cached for this sender.
fn decrypt_header(
    state: &SessionState,
    encrypted_header: &str,
    sender: &PublicKey,
) -> Result<(Header, bool)> {
    if let Some(current) = &state.our_current_ratchet_key {
        if let Ok(decrypted) = nip44::decrypt(&current.secret_key()?, sender, encrypted_header) {
            return Ok((parse_header(&decrypted)?, false));
        }
    }

    let next_secret = state.our_next_ratchet_key.secret_key()?;
    if let Ok(decrypted) = nip44::decrypt(&next_secret, sender, encrypted_header) {
        return Ok((parse_header(&decrypted)?, true));
    }

    if let Some(entry) = state.skipped_keys.get(sender) {
        if let Ok(header) = decrypt_header_with_stored_keys(&entry.header_keys, encrypted_header) {
            return Ok((header, false));
        }
    }

    Err(Error::FailedToDecryptHeader)
}

fn decrypt_header_with_stored_keys(
    header_keys: &[[u8; 32]],
    encrypted_header: &str,
) -> Result<Header> {
    let payload = base64::engine::general_purpose::STANDARD
        .decode(encrypted_header)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    for key in header_keys {
        let conversation_key = ConversationKey::new(*key);
        if let Ok(decrypted) = nip44::v2::decrypt_to_bytes(&conversation_key, &payload) {
            let text =
                String::from_utf8(decrypted).map_err(|e| Error::Decryption(e.to_string()))?;
            return parse_header(&text);
        }
    }
    Err(Error::FailedToDecryptHeader)
}

fn decrypt_with_message_key(message_key: &[u8; 32], ciphertext: &str) -> Result<String> {
    let conversation_key = ConversationKey::new(*message_key);
    let ciphertext_bytes = base64::engine::general_purpose::STANDARD
        .decode(ciphertext)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    let plaintext_bytes = nip44::v2::decrypt_to_bytes(&conversation_key, &ciphertext_bytes)?;
    String::from_utf8(plaintext_bytes).map_err(|e| Error::Decryption(e.to_string()))
}

fn parse_header(json: &str) -> Result<Header> {
    serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
}

fn parse_inner(plaintext: &str) -> Result<UnsignedEvent> {
    serde_json::from_str(plaintext).map_err(|e| Error::Serialization(e.to_string()))
}

fn header_payload(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some("header") {
            values.get(1).cloned()
        } else {
            None
        }
    })
}
