use std::fmt::{Display, Formatter};

/// Returned by a sleep or poll that was interrupted by a hard abort.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct AbortedError {
    msg: String,
}

impl Default for AbortedError {
    fn default() -> Self {
        Self {
            msg: "Execution interrupted by abort signal".to_string(),
        }
    }
}

/// Invalid task or runner configuration. Aborts the affected workload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigurationError(pub String);

/// Arguments or action configuration failed validation. Aborts the affected workload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Validation failed: {0}")]
pub struct ValidationError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid argument: {0}")]
pub struct InvalidArgument(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Context '{context}' failed to set up: {reason}")]
pub struct ContextSetupError {
    pub context: String,
    pub reason: String,
}

/// Identifies a cloud resource in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescription {
    pub resource_type: String,
    pub name: String,
    pub id: String,
}

impl Display for ResourceDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}:{}", self.resource_type, self.name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Resource {resource} has {status} status: {fault}")]
pub struct ResourceErrorStatus {
    pub resource: ResourceDescription,
    pub status: String,
    pub fault: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Resource {resource} was not found")]
pub struct ResourceNotFound {
    pub resource: ResourceDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to get resource {resource}: {reason}")]
pub struct GetResourceFailure {
    pub resource: ResourceDescription,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Timed out waiting for {resource} to become {desired_status}, current status {resource_status}"
)]
pub struct TimeoutError {
    pub resource: ResourceDescription,
    pub desired_status: String,
    pub resource_status: String,
}

/// Name of the first recognised error type in the chain, used as the `etype` of a failed
/// iteration.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(poll_error) = cause.downcast_ref::<crate::poll::PollError>() {
            return poll_error.kind();
        }

        let kind = if cause.is::<ConfigurationError>() {
            "ConfigurationError"
        } else if cause.is::<ValidationError>() {
            "ValidationError"
        } else if cause.is::<InvalidArgument>() {
            "InvalidArgument"
        } else if cause.is::<ContextSetupError>() {
            "ContextSetupError"
        } else if cause.is::<ResourceErrorStatus>() {
            "ResourceErrorStatus"
        } else if cause.is::<ResourceNotFound>() {
            "ResourceNotFound"
        } else if cause.is::<GetResourceFailure>() {
            "GetResourceFailure"
        } else if cause.is::<TimeoutError>() {
            "TimeoutError"
        } else if cause.is::<AbortedError>() {
            "AbortedError"
        } else {
            continue;
        };

        return kind;
    }

    "Error"
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn stack() -> ResourceDescription {
        ResourceDescription {
            resource_type: "Stack".to_string(),
            name: "s_cb_abc".to_string(),
            id: "42".to_string(),
        }
    }

    #[test]
    fn error_kind_sees_through_context() {
        let err = Err::<(), _>(ResourceNotFound { resource: stack() })
            .context("while deleting")
            .unwrap_err();

        assert_eq!("ResourceNotFound", error_kind(&err));
    }

    #[test]
    fn unknown_errors_are_generic() {
        let err = anyhow::anyhow!("boom");
        assert_eq!("Error", error_kind(&err));
    }

    #[test]
    fn configuration_errors_keep_their_kind() {
        let err: anyhow::Error = ConfigurationError("no such runner".to_string()).into();
        assert_eq!("ConfigurationError", error_kind(&err));
    }

    #[test]
    fn timeout_message_names_resource() {
        let err = TimeoutError {
            resource: stack(),
            desired_status: "CREATE_COMPLETE".to_string(),
            resource_status: "CREATE_IN_PROGRESS".to_string(),
        };
        let msg = err.to_string();

        assert!(msg.contains("Stack s_cb_abc:42"));
        assert!(msg.contains("CREATE_COMPLETE"));
        assert!(msg.contains("CREATE_IN_PROGRESS"));
    }
}
