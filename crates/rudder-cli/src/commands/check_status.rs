//! Check-status command: run only the resource status checker

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use rudder_common::command::{CommandRunner, ProcessRunner};
use rudder_common::log::{ConsoleLog, DeploymentLog};
use rudder_common::variables::{names, VariableSet};
use rudder_common::DEFAULT_NAMESPACE;
use rudder_status::manifest::identifiers_from_files;
use rudder_status::{
    KubectlGet, ResourceRetriever, ResourceStatusChecker, ResourceUpdateReporter,
    StatusCheckConfig, StatusEventContext,
};
use rudder_wrapper::context::kubectl_executable;

use super::{load_variables, resolve_working_dir};
use crate::{Error, Result};

/// Check the status of the resources in the given manifests
#[derive(Args, Debug)]
pub struct CheckStatusArgs {
    /// JSON file of deployment variables
    #[arg(long, env = "RUDDER_VARIABLES")]
    pub variables: PathBuf,

    /// Manifest whose resources are tracked (repeatable)
    #[arg(long = "manifest", required = true)]
    pub manifests: Vec<PathBuf>,

    /// Directory manifests are relative to (defaults to the current directory)
    #[arg(long)]
    pub working_dir: Option<PathBuf>,
}

pub async fn run(args: CheckStatusArgs) -> Result<i32> {
    let variables = load_variables(&args.variables)?;
    let working_dir = resolve_working_dir(args.working_dir.clone())?;
    check(
        &variables,
        working_dir,
        &args.manifests,
        Arc::new(ProcessRunner::new()),
        &ConsoleLog::new(),
    )
    .await
}

/// Track the manifests' resources; exit code 0 on success, 1 otherwise
pub async fn check(
    variables: &VariableSet,
    working_dir: PathBuf,
    manifests: &[PathBuf],
    runner: Arc<dyn CommandRunner>,
    log: &dyn DeploymentLog,
) -> Result<i32> {
    let paths = manifests
        .iter()
        .map(|p| {
            p.to_str()
                .map(str::to_string)
                .ok_or_else(|| Error::validation(format!("manifest path {} is not UTF-8", p.display())))
        })
        .collect::<Result<Vec<_>>>()?;
    let namespace = variables.get_or(names::NAMESPACE, DEFAULT_NAMESPACE);
    let identifiers = identifiers_from_files(&working_dir, &paths, namespace)?;

    let query = KubectlGet::new(runner, kubectl_executable(variables, &working_dir)?)
        .with_working_dir(working_dir);
    let checker = ResourceStatusChecker::new(
        ResourceRetriever::new(Arc::new(query)),
        ResourceUpdateReporter::new(StatusEventContext::from_variables(variables), log),
        log,
        StatusCheckConfig::from_variables(variables)?,
    );

    let report = checker.check(identifiers).await;
    Ok(if report.outcome.is_success() { 0 } else { 1 })
}
