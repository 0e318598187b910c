//! Wrapper stages
//!
//! A stage wraps everything inside it: it gets the script environment built
//! so far and a [`Next`] continuation that runs the remaining stages and the
//! script. Stages form a closed set with a fixed nesting order given by
//! [`StageKind`].

use futures::future::BoxFuture;

use rudder_common::Error;

use crate::context::ContextSetupStage;
use crate::discovery::DiscoveryStage;
use crate::pipeline::DeploymentContext;
use crate::script::{CommandResult, ScriptEnvironment, ScriptExecutor};
use crate::status::StatusReportingStage;

/// Position in the nesting order, outermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    /// Kubeconfig and cloud credentials
    ContextSetup,
    /// Target discovery after the script
    Discovery,
    /// Resource status checks after the script
    StatusReporting,
    /// The user script itself
    UserScript,
}

/// A cross-cutting behavior wrapped around the user script.
pub enum WrapperStage {
    /// See [`ContextSetupStage`]
    ContextSetup(ContextSetupStage),
    /// See [`DiscoveryStage`]
    Discovery(DiscoveryStage),
    /// See [`StatusReportingStage`]
    StatusReporting(StatusReportingStage),
}

impl WrapperStage {
    /// Where this stage sits in the nesting order
    pub fn kind(&self) -> StageKind {
        match self {
            WrapperStage::ContextSetup(_) => StageKind::ContextSetup,
            WrapperStage::Discovery(_) => StageKind::Discovery,
            WrapperStage::StatusReporting(_) => StageKind::StatusReporting,
        }
    }

    /// Whether the stage applies to this deployment
    pub fn is_enabled(&self, ctx: &DeploymentContext) -> bool {
        match self {
            WrapperStage::ContextSetup(stage) => stage.is_enabled(ctx),
            WrapperStage::Discovery(stage) => stage.is_enabled(ctx),
            WrapperStage::StatusReporting(stage) => stage.is_enabled(ctx),
        }
    }

    /// Run the stage around `next`
    pub async fn wrap(
        &self,
        ctx: &DeploymentContext,
        env: ScriptEnvironment,
        next: Next<'_>,
    ) -> Result<CommandResult, Error> {
        match self {
            WrapperStage::ContextSetup(stage) => stage.wrap(ctx, env, next).await,
            WrapperStage::Discovery(stage) => stage.wrap(ctx, env, next).await,
            WrapperStage::StatusReporting(stage) => stage.wrap(ctx, env, next).await,
        }
    }
}

/// The rest of the pipeline, from the point of view of one stage.
pub struct Next<'a> {
    stages: &'a [&'a WrapperStage],
    executor: &'a dyn ScriptExecutor,
    ctx: &'a DeploymentContext,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        stages: &'a [&'a WrapperStage],
        executor: &'a dyn ScriptExecutor,
        ctx: &'a DeploymentContext,
    ) -> Self {
        Self {
            stages,
            executor,
            ctx,
        }
    }

    /// Run the remaining stages and then the script with `env`
    pub fn run(self, env: ScriptEnvironment) -> BoxFuture<'a, Result<CommandResult, Error>> {
        Box::pin(async move {
            match self.stages.split_first() {
                Some((stage, rest)) => {
                    let next = Next::new(rest, self.executor, self.ctx);
                    stage.wrap(self.ctx, env, next).await
                }
                None => self.executor.execute(self.ctx, &env).await,
            }
        })
    }
}
