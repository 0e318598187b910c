//! Error types for rudder
//!
//! Errors are structured with fields to aid debugging of failed deployments.
//! Each variant carries the variable, program or resource it concerns so that
//! the deployment log can point the user at the right place.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for rudder operations
#[derive(Debug, Error)]
pub enum Error {
    /// A required deployment variable is missing or malformed
    #[error("configuration error [{variable}]: {message}")]
    Configuration {
        /// Name of the offending deployment variable
        variable: String,
        /// Description of what's wrong
        message: String,
    },

    /// An external command failed to spawn, timed out, or exited non-zero
    #[error("command error [{program}]: {message}")]
    Command {
        /// Program that was executed (kubectl, aws, bash, ...)
        program: String,
        /// Description of what failed
        message: String,
        /// Whether running the command again may succeed
        retryable: bool,
    },

    /// A resource query against the cluster failed
    #[error("query error for {resource}: {message}")]
    Query {
        /// Resource being queried (e.g. "Deployment/nginx")
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Credentials were rejected or could not be exchanged
    #[error("authentication error: {message}")]
    Authentication {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "pipeline", "checker")
        context: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error for the given variable
    pub fn configuration(variable: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            variable: variable.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable command error
    pub fn command(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable command error (e.g. executable not found)
    pub fn command_permanent(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a query error for the given resource
    pub fn query(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Query {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, serialization and authentication errors need a change
    /// in input before a retry can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Configuration { .. } => false,
            Error::Command { retryable, .. } => *retryable,
            Error::Query { .. } => true,
            Error::Serialization { .. } => false,
            Error::Authentication { .. } => false,
            Error::Internal { .. } => true,
            Error::Io(_) => true,
        }
    }

    /// Get the deployment variable name if this is a configuration error
    pub fn variable(&self) -> Option<&str> {
        match self {
            Error::Configuration { variable, .. } => Some(variable),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
