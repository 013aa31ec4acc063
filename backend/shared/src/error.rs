use thiserror::Error;

/// Failure taxonomy shared by the resolver, the calculator and every
/// orchestrator built on top of them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{service} call failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(String),
}

impl DomainError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        DomainError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        DomainError::ExternalService {
            service,
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::ExternalService { .. } | DomainError::Timeout { .. } | DomainError::Store(_)
        )
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Store(err.to_string())
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
