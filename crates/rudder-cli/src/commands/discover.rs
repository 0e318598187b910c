//! Discover command: advertise EKS clusters as deployment targets

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use rudder_aws::{AwsCliCatalog, ClusterDiscoveryEmitter, EnvironmentSnapshot, TargetDiscoveryContext};
use rudder_common::command::{CommandRunner, ProcessRunner};
use rudder_common::log::{ConsoleLog, DeploymentLog};
use rudder_common::variables::{names, VariableSet};

use super::load_variables;
use crate::Result;

/// Discover Kubernetes targets from the discovery context
#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// JSON file of deployment variables
    #[arg(long, env = "RUDDER_VARIABLES")]
    pub variables: PathBuf,
}

pub async fn run(args: DiscoverArgs) -> Result<i32> {
    let variables = load_variables(&args.variables)?;
    discover(
        &variables,
        Arc::new(ProcessRunner::new()),
        &ConsoleLog::new(),
        &EnvironmentSnapshot::from_process(),
    )
    .await
}

/// Emit a `kubernetes-target` message per matching cluster.
///
/// Catalog and credential problems are warnings in `log`, so the exit code is
/// 0 once the discovery context parses.
pub async fn discover(
    variables: &VariableSet,
    runner: Arc<dyn CommandRunner>,
    log: &dyn DeploymentLog,
    environment: &EnvironmentSnapshot,
) -> Result<i32> {
    let context = TargetDiscoveryContext::from_json(variables.require(names::TARGET_DISCOVERY_CONTEXT)?)?;

    let catalog = AwsCliCatalog::new(runner);
    let events = ClusterDiscoveryEmitter::new(&catalog, log)
        .discover(&context, environment)
        .await;

    info!(targets = events.len(), "Discovery finished");
    Ok(0)
}
