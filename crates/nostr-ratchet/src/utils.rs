use crate::{Error, Result, SendOptions, SessionState};
use hkdf::Hkdf;
use nostr::PublicKey;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

/// HKDF-SHA256 with `num_outputs` 32-byte outputs, expanded under info
/// bytes `[1]`, `[2]`, … All ratchet derivations go through this.
pub fn kdf(input: &[u8], salt: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input);

    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_outputs {
        let mut okm = [0u8; 32];
        hk.expand(&[i as u8], &mut okm)
            .expect("32 bytes is valid length");
        outputs.push(okm);
    }
    outputs
}

pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

const TWO_DAYS: u64 = 2 * 24 * 60 * 60;

/// Uniformly random timestamp in `[now − 2 days, now]`. Outer envelopes
/// carry this instead of the real send time to frustrate traffic analysis.
pub fn jittered_now() -> u64 {
    let now = now_seconds();
    now - (rand::random::<u64>() % TWO_DAYS)
}

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidEvent("invalid pubkey length".to_string()));
    }
    PublicKey::from_slice(&bytes).map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub fn serialize_session_state(state: &SessionState) -> Result<String> {
    serde_json::to_string(state).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn deserialize_session_state(data: &str) -> Result<SessionState> {
    serde_json::from_str(data).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn resolve_expiration_seconds(options: &SendOptions, now_seconds: u64) -> Result<Option<u64>> {
    if options.expires_at.is_some() && options.ttl_seconds.is_some() {
        return Err(Error::InvalidEvent(
            "provide either expires_at or ttl_seconds, not both".to_string(),
        ));
    }

    if let Some(expires_at) = options.expires_at {
        return Ok(Some(expires_at));
    }

    if let Some(ttl) = options.ttl_seconds {
        return now_seconds
            .checked_add(ttl)
            .ok_or_else(|| Error::InvalidEvent("ttl_seconds overflow".to_string()))
            .map(Some);
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic_and_outputs_differ() {
        let a = kdf(b"input", b"salt", 3);
        let b = kdf(b"input", b"salt", 3);
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
    }

    #[test]
    fn kdf_salt_changes_output() {
        let a = kdf(b"input", b"salt-1", 1);
        let b = kdf(b"input", b"salt-2", 1);
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn jittered_now_stays_within_window() {
        let now = now_seconds();
        for _ in 0..32 {
            let jittered = jittered_now();
            assert!(jittered <= now + 1);
            assert!(jittered >= now - TWO_DAYS - 1);
        }
    }

    #[test]
    fn expiration_rejects_conflicting_options() {
        let options = SendOptions {
            expires_at: Some(10),
            ttl_seconds: Some(10),
        };
        assert!(resolve_expiration_seconds(&options, 0).is_err());
    }
}
