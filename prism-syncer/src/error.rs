use prism_core::{models::version::VersionError, storage::StorageError};
use thiserror::Error;

/// Error taxonomy of the view syncer.
///
/// `BadRequest` and `BadQuery` fail the originating RPC only and never
/// mutate the CVR. `Internal` fails the current poke and the offending
/// connection. `Unavailable` and `Fatal` terminate the group service; a
/// restart recovers from the last durably flushed CVR version.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid query: {0}")]
    BadQuery(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
    #[error(transparent)]
    Unavailable(#[from] StorageError),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Whether the whole group service has to come down, as opposed to only
    /// the originating client.
    pub fn terminates_group(&self) -> bool {
        matches!(self, SyncError::Unavailable(_) | SyncError::Fatal(_))
    }

    /// Stable kind tag carried on downstream error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::BadRequest(_) => "badRequest",
            SyncError::BadQuery(_) => "badQuery",
            SyncError::Internal(_) => "internal",
            SyncError::Unavailable(_) => "unavailable",
            SyncError::Fatal(_) => "fatal",
        }
    }
}

impl From<VersionError> for SyncError {
    fn from(err: VersionError) -> Self {
        SyncError::BadRequest(err.to_string())
    }
}
