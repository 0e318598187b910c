//! AWS support for rudder
//!
//! Turns the deployment server's authentication payloads into usable
//! credentials and finds the EKS clusters those credentials can see. AWS is
//! only ever reached through the `aws` CLI.

#![deny(missing_docs)]

pub mod auth;
pub mod catalog;
pub mod discovery;
pub mod resolver;

pub use auth::{
    AuthenticationConfig, AwsAccountKeys, AwsAssumedRole, AwsAuthenticationDetails,
    AwsCredentialsConfig, DiscoveryAuthentication,
};
pub use catalog::{AwsCliCatalog, ClusterCatalog, EksCluster};
pub use discovery::{
    ClusterDiscoveryEmitter, DiscoveryEvent, TargetDiscoveryContext, TargetDiscoveryScope,
};
pub use resolver::{resolve, AwsIdentity, EnvironmentSnapshot, ResolvedIdentity};
