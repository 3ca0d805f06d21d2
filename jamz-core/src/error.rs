use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A mutation would leave session state inconsistent; state is unchanged
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// An external collaborator (storage, lookup) failed. Not retried here.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable reason, used in rejection events
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Upstream(_) => "upstream",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
