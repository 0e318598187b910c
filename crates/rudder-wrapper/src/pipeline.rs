//! Wrapper pipeline
//!
//! Picks the stages that apply to a deployment and nests them around the
//! script, outermost first:
//!
//! ```text
//! ContextSetup ( Discovery ( StatusReporting ( UserScript ) ) )
//! ```
//!
//! Stages that don't apply are left out; the others never change places.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use rudder_aws::EnvironmentSnapshot;
use rudder_common::log::DeploymentLog;
use rudder_common::variables::{names, VariableSet};
use rudder_common::{Error, DEFAULT_NAMESPACE};

use crate::script::{CommandResult, ScriptEnvironment, ScriptExecutor};
use crate::stage::{Next, StageKind, WrapperStage};

/// Everything a stage knows about the deployment it wraps.
pub struct DeploymentContext {
    /// Deployment variables
    pub variables: VariableSet,
    /// Directory the script runs in
    pub working_dir: PathBuf,
    /// User-facing deployment log
    pub log: Arc<dyn DeploymentLog>,
    /// Worker environment used for worker credentials
    pub environment: EnvironmentSnapshot,
}

impl DeploymentContext {
    /// Context with an empty worker environment
    pub fn new(
        variables: VariableSet,
        working_dir: impl Into<PathBuf>,
        log: Arc<dyn DeploymentLog>,
    ) -> Self {
        Self {
            variables,
            working_dir: working_dir.into(),
            log,
            environment: EnvironmentSnapshot::new(),
        }
    }

    /// Use `environment` as the worker environment
    pub fn with_environment(mut self, environment: EnvironmentSnapshot) -> Self {
        self.environment = environment;
        self
    }

    /// Namespace the deployment targets
    pub fn namespace(&self) -> &str {
        self.variables.get_or(names::NAMESPACE, DEFAULT_NAMESPACE)
    }
}

/// Stages in nesting order plus the script executor at the centre.
pub struct Pipeline {
    stages: Vec<WrapperStage>,
    executor: Arc<dyn ScriptExecutor>,
}

impl Pipeline {
    /// Pipeline with no stages around `executor`
    pub fn new(executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            stages: Vec::new(),
            executor,
        }
    }

    /// Add a stage; it lands in its fixed position whatever the call order
    pub fn with_stage(mut self, stage: WrapperStage) -> Self {
        self.stages.push(stage);
        self.stages.sort_by_key(WrapperStage::kind);
        self
    }

    fn enabled_stages(&self, ctx: &DeploymentContext) -> Vec<&WrapperStage> {
        self.stages.iter().filter(|s| s.is_enabled(ctx)).collect()
    }

    /// Stages that would run for `ctx`, outermost first, ending with the script
    pub fn plan(&self, ctx: &DeploymentContext) -> Vec<StageKind> {
        self.enabled_stages(ctx)
            .iter()
            .map(|s| s.kind())
            .chain(std::iter::once(StageKind::UserScript))
            .collect()
    }

    /// Run the enabled stages and the script
    pub async fn execute(&self, ctx: &DeploymentContext) -> Result<CommandResult, Error> {
        let stages = self.enabled_stages(ctx);
        info!(plan = ?self.plan(ctx), "Running wrapper pipeline");
        Next::new(&stages, self.executor.as_ref(), ctx)
            .run(ScriptEnvironment::new())
            .await
    }
}
