use nostr::Keys;
use nostr_ratchet::{Result, Session, MAX_SKIP};

fn session_pair() -> Result<(Session, Session)> {
    let alice_keys = Keys::generate();
    let bob_keys = Keys::generate();
    let shared_secret = [7u8; 32];

    let alice = Session::init(
        None,
        bob_keys.public_key(),
        alice_keys.secret_key().to_secret_bytes(),
        true,
        shared_secret,
        Some("alice".to_string()),
    )?;
    let bob = Session::init(
        None,
        alice_keys.public_key(),
        bob_keys.secret_key().to_secret_bytes(),
        false,
        shared_secret,
        Some("bob".to_string()),
    )?;
    Ok((alice, bob))
}

#[test]
fn permuted_delivery_decrypts_in_permuted_order() -> Result<()> {
    let (alice, bob) = session_pair()?;

    let e1 = alice.send("one")?;
    let e2 = alice.send("two")?;
    let e3 = alice.send("three")?;

    // Delivery order e3, e1, e2 must yield exactly that order.
    let mut received = Vec::new();
    for event in [&e3.event, &e1.event, &e2.event] {
        received.push(bob.decrypt_event(event).expect("decrypts").content.clone());
    }
    assert_eq!(received, vec!["three", "one", "two"]);

    Ok(())
}

#[test]
fn consecutive_messages_after_rotation() -> Result<()> {
    let (alice, bob) = session_pair()?;

    bob.decrypt_event(&alice.send("Alice 1")?.event).unwrap();

    let bob_msg1 = bob.send("Bob 1")?;
    let bob_msg2 = bob.send("Bob 2")?;

    assert_eq!(
        alice.decrypt_event(&bob_msg1.event).unwrap().content,
        "Bob 1"
    );
    assert_eq!(
        alice.decrypt_event(&bob_msg2.event).unwrap().content,
        "Bob 2"
    );

    Ok(())
}

#[test]
fn skipped_keys_are_consumed_exactly_once() -> Result<()> {
    let (alice, bob) = session_pair()?;

    let e1 = alice.send("one")?;
    let e2 = alice.send("two")?;

    assert_eq!(bob.decrypt_event(&e2.event).unwrap().content, "two");
    assert!(!bob.snapshot().skipped_keys.is_empty());

    assert_eq!(bob.decrypt_event(&e1.event).unwrap().content, "one");
    // Cache entry drained and evicted with the last key.
    assert!(bob.snapshot().skipped_keys.is_empty());

    // Replay of the skipped message no longer decrypts.
    assert!(bob.decrypt_event(&e1.event).is_none());

    Ok(())
}

#[test]
fn straggler_from_rotated_chain_still_decrypts() -> Result<()> {
    let (alice, bob) = session_pair()?;

    // Chain 1: m1 goes missing, m2 arrives and caches m1's key.
    let m1 = alice.send("one")?;
    let m2 = alice.send("two")?;
    assert_eq!(bob.decrypt_event(&m2.event).unwrap().content, "two");

    // Full round trip so both sides ratchet. Bob's own keys rotate twice
    // in the process.
    let reply = bob.send("ack")?;
    assert_eq!(alice.decrypt_event(&reply.event).unwrap().content, "ack");
    let m3 = alice.send("three")?;
    assert_eq!(bob.decrypt_event(&m3.event).unwrap().content, "three");

    // m1 is now authored by a ratchet key Bob no longer tracks as
    // current or next; the cached header keys must carry it.
    let snapshot = bob.snapshot();
    assert_ne!(snapshot.their_current_ratchet_key, Some(m1.event.pubkey));
    assert_ne!(snapshot.their_next_ratchet_key, Some(m1.event.pubkey));

    assert_eq!(bob.decrypt_event(&m1.event).unwrap().content, "one");

    Ok(())
}

#[test]
fn gap_beyond_max_skip_is_refused() -> Result<()> {
    let (alice, bob) = session_pair()?;

    // Establish the receiving chain first.
    bob.decrypt_event(&alice.send("start")?.event).unwrap();

    // Message numbers 1..=MAX_SKIP+2; receiving the last one would need
    // MAX_SKIP + 1 skipped keys.
    let mut last = None;
    for i in 0..MAX_SKIP + 2 {
        last = Some(alice.send(format!("burst {i}"))?);
    }
    let last = last.unwrap();
    let before = bob.snapshot();
    assert!(bob.decrypt_event(&last.event).is_none());
    assert_eq!(bob.snapshot(), before);
    assert_eq!(bob.stats().crypto_failures(), 1);

    Ok(())
}

#[test]
fn interleaved_conversation_with_losses() -> Result<()> {
    let (alice, bob) = session_pair()?;

    let a1 = alice.send("a1")?;
    let a2 = alice.send("a2")?;
    let a3 = alice.send("a3")?;

    // a1 lost for now; a3 then a2 arrive.
    assert_eq!(bob.decrypt_event(&a3.event).unwrap().content, "a3");
    assert_eq!(bob.decrypt_event(&a2.event).unwrap().content, "a2");

    let b1 = bob.send("b1")?;
    assert_eq!(alice.decrypt_event(&b1.event).unwrap().content, "b1");

    let a4 = alice.send("a4")?;
    assert_eq!(bob.decrypt_event(&a4.event).unwrap().content, "a4");

    // The loss finally shows up, one chain late.
    assert_eq!(bob.decrypt_event(&a1.event).unwrap().content, "a1");

    Ok(())
}
