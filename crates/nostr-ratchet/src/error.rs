use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid or missing header")]
    InvalidHeader,

    #[error("failed to decrypt header with available keys")]
    FailedToDecryptHeader,

    #[error("too many skipped messages")]
    TooManySkippedMessages,

    #[error("session cannot send yet")]
    SessionNotReady,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device id required")]
    DeviceIdRequired,

    #[error("ephemeral private key not available on this device")]
    EphemeralKeyUnavailable,

    #[error("invite error: {0}")]
    Invite(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    NostrEvent(#[from] nostr::event::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),
}

impl Error {
    /// Whether this failure came out of the AEAD/header layer, as opposed
    /// to a structurally broken event. Inbound handling swallows both but
    /// counts them separately.
    pub fn is_crypto_failure(&self) -> bool {
        matches!(
            self,
            Error::Decryption(_)
                | Error::FailedToDecryptHeader
                | Error::TooManySkippedMessages
                | Error::Nip44(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
