//! Error handling
//!
//! `StoreError` describes failures of the backend adapters (record store,
//! change feed, identity). `SyncError` is what the synchronizer reports to
//! its caller, and wraps a `StoreError` where one exists.

use std::time::Duration;

use thiserror::Error;

use crate::models::ValidationError;

/// Errors raised by backend adapters
#[derive(Error, Debug)]
pub enum StoreError {
    /// Request never produced a response
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("Backend returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Missing, expired or rejected credentials
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Row does not exist (or is not visible to this user)
    #[error("Bookmark not found: {0}")]
    NotFound(String),

    /// Local SQLite backend error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload could not be decoded
    #[error("Invalid response payload: {0}")]
    Decode(String),

    /// Websocket or channel failure in the change feed
    #[error("Change feed transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Classify an HTTP status from the backend
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => StoreError::Unauthorized(message),
            404 => StoreError::NotFound(message),
            _ => StoreError::Status { status, message },
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(_) | StoreError::Transport(_) => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

/// Errors surfaced by the live collection synchronizer
#[derive(Error, Debug)]
pub enum SyncError {
    /// No signed-in user for an operation that needs an owner
    #[error("You must be logged in to manage bookmarks")]
    AuthRequired,

    /// Bulk load of the user's bookmarks failed
    #[error("Failed to load bookmarks: {0}")]
    FetchFailed(#[source] StoreError),

    /// Bulk load did not finish in time
    #[error("Loading bookmarks timed out after {0:?}")]
    FetchTimeout(Duration),

    /// Insert, update or delete rejected by the store
    #[error("Failed to save change: {0}")]
    MutationFailed(#[source] StoreError),

    /// Form input rejected before reaching the store
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Change feed transport failed
    #[error("Live updates interrupted: {0}")]
    SubscriptionDropped(String),

    /// The synchronizer was torn down
    #[error("Bookmark view is closed")]
    Closed,
}

impl SyncError {
    /// Check if the caller can recover by retrying or re-initializing
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::FetchFailed(e) | SyncError::MutationFailed(e) => e.is_transient(),
            SyncError::FetchTimeout(_) | SyncError::SubscriptionDropped(_) => true,
            SyncError::AuthRequired | SyncError::Invalid(_) | SyncError::Closed => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::AuthRequired => Some("Sign in with `shelf login` and try again."),
            SyncError::FetchFailed(StoreError::Unauthorized(_))
            | SyncError::MutationFailed(StoreError::Unauthorized(_)) => {
                Some("Your session may have expired. Sign in again with `shelf login`.")
            }
            SyncError::FetchFailed(_) | SyncError::FetchTimeout(_) => {
                Some("Check your connection and the api_url setting, then reload.")
            }
            SyncError::SubscriptionDropped(_) => {
                Some("Live updates resume automatically once the connection is back.")
            }
            _ => None,
        }
    }
}

impl StoreError {
    /// Copy of this error for a second recipient
    ///
    /// HTTP and database errors cannot be cloned and keep only their message.
    pub(crate) fn share(&self) -> Self {
        match self {
            StoreError::Http(e) => StoreError::Transport(e.to_string()),
            StoreError::Database(e) => StoreError::Transport(e.to_string()),
            StoreError::Status { status, message } => StoreError::Status {
                status: *status,
                message: message.clone(),
            },
            StoreError::Unauthorized(m) => StoreError::Unauthorized(m.clone()),
            StoreError::NotFound(m) => StoreError::NotFound(m.clone()),
            StoreError::Decode(m) => StoreError::Decode(m.clone()),
            StoreError::Transport(m) => StoreError::Transport(m.clone()),
        }
    }
}

impl SyncError {
    /// Copy of this error for a second recipient, see `StoreError::share`
    pub(crate) fn share(&self) -> Self {
        match self {
            SyncError::AuthRequired => SyncError::AuthRequired,
            SyncError::FetchFailed(e) => SyncError::FetchFailed(e.share()),
            SyncError::FetchTimeout(d) => SyncError::FetchTimeout(*d),
            SyncError::MutationFailed(e) => SyncError::MutationFailed(e.share()),
            SyncError::Invalid(e) => SyncError::Invalid(e.clone()),
            SyncError::SubscriptionDropped(m) => SyncError::SubscriptionDropped(m.clone()),
            SyncError::Closed => SyncError::Closed,
        }
    }
}

/// Result type for adapter operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            StoreError::from_status(401, "jwt expired"),
            StoreError::Unauthorized(_)
        ));
        assert!(matches!(
            StoreError::from_status(404, "missing"),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            StoreError::from_status(500, "boom"),
            StoreError::Status { status: 500, .. }
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(StoreError::from_status(503, "unavailable").is_transient());
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(!StoreError::from_status(400, "bad request").is_transient());
        assert!(!StoreError::Unauthorized("nope".into()).is_transient());
    }

    #[test]
    fn test_sync_error_recoverable() {
        assert!(SyncError::FetchTimeout(Duration::from_secs(10)).is_recoverable());
        assert!(SyncError::FetchFailed(StoreError::from_status(502, "gateway")).is_recoverable());
        assert!(!SyncError::AuthRequired.is_recoverable());
        assert!(!SyncError::MutationFailed(StoreError::NotFound("a".into())).is_recoverable());
    }

    #[test]
    fn test_recovery_suggestions() {
        assert!(SyncError::AuthRequired.recovery_suggestion().is_some());
        let expired = SyncError::FetchFailed(StoreError::Unauthorized("expired".into()));
        assert!(expired.recovery_suggestion().unwrap().contains("login"));
        assert!(SyncError::Closed.recovery_suggestion().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Invalid(ValidationError::MissingFields);
        assert_eq!(err.to_string(), "Please fill in all fields");

        let err = SyncError::MutationFailed(StoreError::from_status(409, "duplicate"));
        let msg = err.to_string();
        assert!(msg.contains("409"));
        assert!(msg.contains("duplicate"));
    }
}
