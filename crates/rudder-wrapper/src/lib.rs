//! Wrapper pipeline around deployment scripts
//!
//! A deployment step runs a user script. Depending on the deployment's
//! variables, rudder wraps that script with a Kubernetes context, target
//! discovery and resource status checks. [`Pipeline`] decides which of those
//! apply and nests them in their fixed order.

#![deny(missing_docs)]

pub mod context;
pub mod discovery;
pub mod pipeline;
pub mod script;
pub mod stage;
pub mod status;

#[cfg(test)]
mod testing;

pub use context::ContextSetupStage;
pub use discovery::DiscoveryStage;
pub use pipeline::{DeploymentContext, Pipeline};
pub use script::{CommandResult, ScriptEnvironment, ScriptExecutor, ScriptSyntax, ShellScriptExecutor};
pub use stage::{Next, StageKind, WrapperStage};
pub use status::StatusReportingStage;
