use thiserror::Error;

/// Domain errors surfaced by the user service. The HTTP layer maps these to
/// status codes; LMS failures outside `SyncFailed` are swallowed by design.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("User not found")]
    NotFound,

    #[error("User with this email already exists")]
    DuplicateEmail,

    #[error("Failed to sync user to Moodle: {0}")]
    SyncFailed(String),

    #[error("Password hashing failed: {0}")]
    Password(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
