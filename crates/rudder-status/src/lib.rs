//! Kubernetes resource status tracking for rudder deployments
//!
//! After a deployment script applies manifests, the checker follows the
//! resulting objects (and the objects they own) until they are ready, fail,
//! or the deployment timeout runs out, reporting every change as it happens.

#![deny(missing_docs)]

pub mod checker;
pub mod kubectl;
pub mod manifest;
pub mod reporter;
pub mod resource;
pub mod retriever;
pub mod scrub;

pub use checker::{CheckOutcome, ResourceStatusChecker, StatusCheckConfig, StatusCheckReport};
pub use kubectl::{KubectlGet, ResourceQuery};
pub use reporter::{ResourceUpdateReporter, StatusEventContext};
pub use resource::{ResourceIdentifier, ResourceState, ResourceStatus};
pub use retriever::{ResourceRetriever, ResourceTree};
