use thiserror::Error;

use palaver_store::StoreError;

/// Errors surfaced by messaging operations. No state is mutated when one of
/// these is returned.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Acting user lacks the role required for a management operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Sender is not allowed to produce content in this conversation.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// Operation targeted a record that does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Operation arguments are structurally invalid.
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Convert a store-level miss into a caller-facing not-found for `what`.
pub(crate) fn not_found(what: &'static str) -> impl FnOnce(StoreError) -> MessagingError {
    move |e| match e {
        StoreError::NotFound => MessagingError::NotFound(what),
        other => MessagingError::Store(other),
    }
}
