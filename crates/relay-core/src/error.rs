use relay_auth::CipherError;
use relay_ingest::{SignalStoreError, StoreError};

/// Failure classes surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    AuthFailed(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Encryption(String),
    #[error("{0}")]
    Persist(String),
    #[error("slack is not connected")]
    NotConnected,
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        RelayError::Persist(err.to_string())
    }
}

impl From<CipherError> for RelayError {
    fn from(err: CipherError) -> Self {
        RelayError::Encryption(err.to_string())
    }
}

impl From<SignalStoreError> for RelayError {
    fn from(err: SignalStoreError) -> Self {
        match err {
            SignalStoreError::Local(err) => RelayError::Persist(err.to_string()),
            SignalStoreError::Remote(err) => RelayError::Upstream(err.to_string()),
        }
    }
}

/// Ways the OAuth callback can fail once state and code are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("Invalid or expired OAuth state")]
    StateInvalid,
    #[error("Failed to complete Slack OAuth")]
    ExchangeFailed,
    #[error("Slack OAuth returned incomplete data")]
    IncompleteUpstreamData,
    #[error("Failed to secure Slack token")]
    EncryptionFailed,
    #[error("Failed to store Slack connection")]
    PersistFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("{0}")]
    AuthFailed(String),
    #[error("invalid webhook payload")]
    InvalidPayload,
    #[error("missing event_id")]
    MissingEventId,
    #[error("failed to persist event")]
    Persist(#[source] StoreError),
}
