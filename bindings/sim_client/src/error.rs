use thiserror::Error;

/// Errors returned by the simulated cloud's APIs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimApiError {
    #[error("Authentication failed for {0}")]
    Unauthorized(String),
    #[error("{0} requires admin credentials")]
    Forbidden(String),
    #[error("{kind} {id} could not be found")]
    NotFound { kind: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("The {0} service is not available in this cloud")]
    ServiceUnavailable(String),
    /// A failure scheduled with [crate::Fault::ApiError].
    #[error("API call {operation} failed: {message}")]
    Injected { operation: String, message: String },
}

pub type SimResult<T> = Result<T, SimApiError>;
