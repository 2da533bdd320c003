//! Double Ratchet encrypted sessions carried over signed Nostr events.
//!
//! A [`Session`] is a pairwise Double Ratchet whose ciphertexts travel as
//! ordinary signed events: the event `pubkey` is the sender's current
//! ratchet key, so each DH step makes consecutive messages unlinkable and
//! lets receivers subscribe by author. [`Invite`] bootstraps sessions from
//! a shared secret and an inviter-held ephemeral key; [`InviteList`] is the
//! owner-side device registry published as one replaceable event. The
//! relay connection itself stays outside the crate: callers hand in a
//! [`Subscribe`] capability and publish the returned events themselves.

mod bus;
mod error;
mod file_storage;
mod invite;
mod invite_list;
mod ratchet;
mod session;
mod storage;
mod store;
mod types;
mod user_record;
pub mod utils;

pub use bus::{build_filter, match_filter, EventCallback, FilterBuilder, Subscribe, Unsubscribe};
pub use error::{Error, Result};
pub use file_storage::FileStorage;
pub use invite::{Decryptor, Encryptor, Invite, InviteResponse, OnSession};
pub use invite_list::{DeviceEntry, InviteList, RemovedDevice};
pub use ratchet::decrypt_event_with_state;
pub use session::{DecryptStats, MessageCallback, Session};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use store::UserRecordStore;
pub use types::{
    Header, RatchetKeyPair, SendOptions, SentMessage, SessionState, SkippedKeys,
    CHAT_MESSAGE_KIND, EXPIRATION_TAG, INVITE_EVENT_KIND, INVITE_LIST_D_TAG, INVITE_LIST_KIND,
    INVITE_RESPONSE_KIND, MAX_SKIP, MAX_SKIP_AGGREGATE, MESSAGE_EVENT_KIND, REACTION_KIND,
    RECEIPT_KIND, TYPING_KIND,
};
pub use user_record::{
    DeviceRecord, StoredDeviceRecord, StoredSession, StoredUserRecord, UserRecord,
};
