//! Target discovery after the script

use std::sync::Arc;

use tracing::warn;

use rudder_aws::{ClusterCatalog, ClusterDiscoveryEmitter, TargetDiscoveryContext};
use rudder_common::variables::names;
use rudder_common::Error;

use crate::pipeline::DeploymentContext;
use crate::script::{CommandResult, ScriptEnvironment};
use crate::stage::Next;

/// Advertises discovered clusters once the script has run.
///
/// The script's result passes through untouched; a discovery request that
/// cannot be parsed is reported as a warning.
pub struct DiscoveryStage {
    catalog: Arc<dyn ClusterCatalog>,
}

impl DiscoveryStage {
    /// Stage discovering clusters through `catalog`
    pub fn new(catalog: Arc<dyn ClusterCatalog>) -> Self {
        Self { catalog }
    }

    /// Enabled when the deployment carries a discovery request
    pub fn is_enabled(&self, ctx: &DeploymentContext) -> bool {
        ctx.variables.is_set(names::TARGET_DISCOVERY_CONTEXT)
    }

    /// Run `next`, then discover
    pub async fn wrap(
        &self,
        ctx: &DeploymentContext,
        env: ScriptEnvironment,
        next: Next<'_>,
    ) -> Result<CommandResult, Error> {
        let result = next.run(env).await?;

        let raw = ctx.variables.get_or(names::TARGET_DISCOVERY_CONTEXT, "");
        match TargetDiscoveryContext::from_json(raw) {
            Ok(discovery) => {
                ClusterDiscoveryEmitter::new(self.catalog.as_ref(), ctx.log.as_ref())
                    .discover(&discovery, &ctx.environment)
                    .await;
            }
            Err(e) => {
                let e = Error::configuration(names::TARGET_DISCOVERY_CONTEXT, e.to_string());
                warn!(error = %e, "Skipping target discovery");
                ctx.log
                    .warn(&format!("Target discovery was skipped: {}", e));
            }
        }
        Ok(result)
    }
}
