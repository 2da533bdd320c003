use nostr::Keys;
use nostr_ratchet::{
    DeviceEntry, Error, InviteList, Result, INVITE_LIST_D_TAG, INVITE_LIST_KIND,
};

fn signed_list_event(list: &InviteList, keys: &Keys) -> Result<nostr::Event> {
    list.get_event()?
        .sign(keys)
        .map_err(|e| Error::Invite(e.to_string()))
}

#[test]
fn canonical_event_round_trip() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());
    list.create_device_entry("phone", Some("Phone".to_string()))?;
    list.create_device_entry("laptop", None)?;
    list.remove_device("old-tablet");
    list.main_device_id = Some("phone".to_string());

    let event = signed_list_event(&list, &owner)?;
    assert_eq!(event.kind.as_u16(), INVITE_LIST_KIND as u16);
    assert!(event.tags.iter().any(|t| {
        let v = t.as_slice();
        v.first().map(String::as_str) == Some("d")
            && v.get(1).map(String::as_str) == Some(INVITE_LIST_D_TAG)
    }));
    assert_eq!(
        event
            .tags
            .iter()
            .filter(|t| t.as_slice().first().map(String::as_str) == Some("device"))
            .count(),
        2
    );

    let parsed = InviteList::from_event(&event)?;
    assert_eq!(parsed.owner, owner.public_key());
    assert_eq!(parsed.devices().count(), 2);
    assert_eq!(parsed.main_device_id, Some("phone".to_string()));
    assert_eq!(parsed.version, 1);
    assert!(parsed.is_removed("old-tablet"));

    let phone = parsed.device("phone").expect("phone entry");
    assert_eq!(phone.label, Some("Phone".to_string()));
    assert_eq!(
        phone.ephemeral_public_key,
        list.device("phone").unwrap().ephemeral_public_key
    );
    assert_eq!(
        phone.shared_secret,
        list.device("phone").unwrap().shared_secret
    );
    // The ephemeral secret never rides on the event.
    assert!(phone.ephemeral_private_key.is_none());
    assert!(list.device("phone").unwrap().ephemeral_private_key.is_some());

    Ok(())
}

#[test]
fn from_event_rejects_bad_signature() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());
    list.create_device_entry("phone", None)?;

    let event = signed_list_event(&list, &owner)?;

    // Flip the content after signing.
    let mut json = serde_json::to_value(&event)?;
    json["content"] = serde_json::Value::String("tampered".to_string());
    let tampered: nostr::Event = serde_json::from_value(json)?;

    assert!(InviteList::from_event(&tampered).is_err());
    Ok(())
}

#[test]
fn malformed_tags_are_dropped_silently() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());
    let good = list.create_device_entry("good", None)?;

    let mut json = serde_json::to_value(list.get_event()?)?;
    let tags = json["tags"].as_array_mut().unwrap();
    // Truncated device tag, non-hex key material, and a removed tag
    // with an unparseable timestamp.
    tags.push(serde_json::json!(["device", "deadbeef"]));
    tags.push(serde_json::json!([
        "device",
        "zz".repeat(32),
        "11".repeat(32),
        "bad-key-device",
        ""
    ]));
    tags.push(serde_json::json!(["removed", "whenever", "not-a-number"]));

    let unsigned: nostr::UnsignedEvent = serde_json::from_value(json)?;
    let event = unsigned
        .sign(&owner)
        .map_err(|e| Error::Invite(e.to_string()))?;

    let parsed = InviteList::from_event(&event)?;
    assert_eq!(parsed.devices().count(), 1);
    assert_eq!(
        parsed.device("good").unwrap().ephemeral_public_key,
        good.ephemeral_public_key
    );
    assert!(parsed.removed().is_empty());

    Ok(())
}

#[test]
fn removed_device_cannot_return() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());

    let entry = list.create_device_entry("phone", None)?;
    list.remove_device("phone");
    assert!(list.device("phone").is_none());

    // Direct re-add is a no-op, creating a fresh entry fails.
    assert!(!list.add_device(entry));
    assert!(list.device("phone").is_none());
    assert!(list.create_device_entry("phone", None).is_err());

    Ok(())
}

#[test]
fn merge_is_commutative_and_idempotent() -> Result<()> {
    let owner = Keys::generate();

    let mut a = InviteList::new(owner.public_key());
    a.create_device_entry("phone", None)?;
    a.create_device_entry("laptop", None)?;
    a.created_at = 100;

    let mut b = InviteList::new(owner.public_key());
    b.create_device_entry("tablet", None)?;
    b.remove_device("laptop");
    b.created_at = 200;

    let observable = |list: &InviteList| {
        let mut devices: Vec<String> =
            list.devices().map(|d| d.device_id.clone()).collect();
        devices.sort();
        let mut removed: Vec<(String, u64)> = list
            .removed()
            .iter()
            .map(|r| (r.device_id.clone(), r.removed_at))
            .collect();
        removed.sort();
        (devices, removed, list.version, list.main_device_id.clone())
    };

    let ab = a.merge(&b);
    let ba = b.merge(&a);
    assert_eq!(observable(&ab), observable(&ba));

    // laptop was tombstoned in b, so it must not survive the merge even
    // though a still lists it.
    assert!(ab.device("laptop").is_none());
    assert!(ab.is_removed("laptop"));
    assert!(ab.device("phone").is_some());
    assert!(ab.device("tablet").is_some());

    // Idempotence.
    assert_eq!(observable(&ab.merge(&ab)), observable(&ab));
    assert_eq!(observable(&ab.merge(&b)), observable(&ab));

    Ok(())
}

#[test]
fn merge_prefers_fresher_replica_fields() -> Result<()> {
    let owner = Keys::generate();

    let mut a = InviteList::new(owner.public_key());
    a.create_device_entry("phone", None)?;
    a.main_device_id = Some("phone".to_string());
    a.version = 1;
    a.created_at = 100;

    let mut b = InviteList::new(owner.public_key());
    b.create_device_entry("tablet", None)?;
    b.main_device_id = Some("tablet".to_string());
    b.version = 2;
    b.created_at = 200;

    let merged = a.merge(&b);
    assert_eq!(merged.main_device_id, Some("tablet".to_string()));
    assert_eq!(merged.version, 2);
    assert_eq!(merged.created_at, 200);

    Ok(())
}

#[test]
fn tombstones_keep_the_latest_timestamp() -> Result<()> {
    let owner = Keys::generate();

    let mut a = InviteList::new(owner.public_key());
    a.remove_device("phone");
    let mut b = InviteList::new(owner.public_key());
    b.remove_device("phone");

    let newer = a.removed()[0].removed_at.max(b.removed()[0].removed_at);

    let merged = a.merge(&b);
    assert_eq!(merged.removed().len(), 1);
    assert_eq!(merged.removed()[0].removed_at, newer);

    Ok(())
}

#[test]
fn local_serialization_keeps_secrets() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());
    list.create_device_entry("phone", Some("Phone".to_string()))?;

    let restored = InviteList::deserialize(&list.serialize()?)?;
    assert_eq!(restored, list);
    assert!(restored
        .device("phone")
        .unwrap()
        .ephemeral_private_key
        .is_some());

    Ok(())
}

#[test]
fn invite_for_unknown_device_fails() {
    let owner = Keys::generate();
    let list = InviteList::new(owner.public_key());

    assert!(matches!(
        list.invite_for("nope"),
        Err(Error::UnknownDevice(_))
    ));
}

#[test]
fn entries_parsed_from_events_cannot_listen() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());
    list.create_device_entry("phone", None)?;

    let event = signed_list_event(&list, &owner)?;
    let public_copy = InviteList::from_event(&event)?;

    let invite = public_copy.invite_for("phone")?;
    assert!(invite.inviter_ephemeral_private_key.is_none());

    Ok(())
}

#[test]
fn add_device_accepts_foreign_entries() -> Result<()> {
    let owner = Keys::generate();
    let mut list = InviteList::new(owner.public_key());

    let entry = DeviceEntry {
        ephemeral_public_key: Keys::generate().public_key(),
        shared_secret: [9u8; 32],
        device_id: "imported".to_string(),
        label: None,
        ephemeral_private_key: None,
    };
    assert!(list.add_device(entry.clone()));
    // Second add of the same id is a no-op.
    assert!(!list.add_device(entry));
    assert_eq!(list.devices().count(), 1);

    Ok(())
}
