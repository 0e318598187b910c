//! Common plumbing for rudder: deployment variables, the deployment log,
//! errors, external commands and retries

#![deny(missing_docs)]

pub mod command;
pub mod error;
pub mod log;
pub mod retry;
pub mod telemetry;
pub mod variables;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace when a deployment doesn't name one
pub const DEFAULT_NAMESPACE: &str = "default";
