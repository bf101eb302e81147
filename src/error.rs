//! Error taxonomy shared by the fetcher, the orchestrator and the relay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote rejected the cached access token. Handled inside the
    /// fetcher with a single refresh-and-retry; escalates to `RemoteApi`
    /// when the refreshed token is rejected too.
    #[error("access token expired")]
    ExpiredCredential,

    /// Any other non-success remote response. Fatal to the calling stage.
    #[error("catalog error {status}: {body}")]
    RemoteApi { status: u16, body: String },

    /// Malformed inbound relay message or unresolvable user/notification id.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A stage was asked to run against state it must not touch, e.g.
    /// analysis of an unsynced playlist. Rejected before any write.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
