//! Kubernetes target discovery
//!
//! A discovery request names the scope new targets belong to and how to
//! authenticate against AWS. Every EKS cluster in the requested regions whose
//! tags match the scope is advertised to the deployment server as one
//! `kubernetes-target` service message.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rudder_common::log::{DeploymentLog, ServiceMessage};
use rudder_common::variables::flag_token;
use rudder_common::Error;

use crate::auth::DiscoveryAuthentication;
use crate::catalog::{ClusterCatalog, EksCluster};
use crate::resolver::{resolve, AssumedRoleContext, CredentialSource, EnvironmentSnapshot};

/// Service message type for a discovered target
pub const DISCOVERY_MESSAGE_NAME: &str = "kubernetes-target";

/// Cluster tag naming the target role
pub const ROLE_TAG: &str = "octopus-role";

/// Cluster tag naming the environment a cluster belongs to
pub const ENVIRONMENT_TAG: &str = "octopus-environment";

/// Where discovered targets are registered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDiscoveryScope {
    /// Space the deployment runs in
    #[serde(default)]
    pub space_name: Option<String>,
    /// Environment targets are created in
    #[serde(default)]
    pub environment_name: Option<String>,
    /// Project driving the discovery
    #[serde(default)]
    pub project_name: Option<String>,
    /// Target roles of the step
    #[serde(default)]
    pub roles: Vec<String>,
    /// Worker pool new targets run their work on
    #[serde(default)]
    pub worker_pool_id: Option<String>,
}

impl TargetDiscoveryScope {
    /// Role a cluster is registered with, or `None` when it is out of scope
    pub fn match_cluster(&self, cluster: &EksCluster) -> Option<&str> {
        if let Some(environment) = cluster.tags.get(ENVIRONMENT_TAG) {
            if self.environment_name.as_deref() != Some(environment.as_str()) {
                return None;
            }
        }
        match cluster.tags.get(ROLE_TAG) {
            Some(role) => self
                .roles
                .iter()
                .find(|r| *r == role)
                .map(String::as_str),
            None => self.roles.first().map(String::as_str),
        }
    }
}

/// Content of the `Octopus.TargetDiscovery.Context` variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDiscoveryContext {
    /// Registration scope
    pub scope: TargetDiscoveryScope,
    /// Provider authentication
    pub authentication: DiscoveryAuthentication,
}

impl TargetDiscoveryContext {
    /// Parse the discovery context JSON
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::serialization_for_kind("TargetDiscoveryContext", e.to_string()))
    }
}

/// One discovered cluster, ready to be registered as a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    /// Cluster ARN, used as the target name
    pub name: String,
    /// EKS cluster name
    pub cluster_name: String,
    /// API server URL
    pub cluster_url: String,
    /// Default worker pool of the target
    pub worker_pool: Option<String>,
    /// Account the target authenticates with
    pub account_id: Option<String>,
    /// Target role
    pub role: String,
    /// Whether the target uses the worker's credentials
    pub use_worker_credentials: bool,
    /// Role the target assumes
    pub assumed_role: Option<AssumedRoleContext>,
}

impl DiscoveryEvent {
    /// Encode as a `kubernetes-target` service message
    pub fn to_service_message(&self) -> ServiceMessage {
        let mut message = ServiceMessage::new(DISCOVERY_MESSAGE_NAME)
            .with("name", &self.name)
            .with("clusterName", &self.cluster_name)
            .with("clusterUrl", &self.cluster_url)
            .with("skipTlsVerification", flag_token(true))
            .with(
                "octopusDefaultWorkerPoolIdOrName",
                self.worker_pool.as_deref().unwrap_or_default(),
            );
        if let Some(account_id) = &self.account_id {
            message = message.with("octopusAccountIdOrName", account_id);
        }
        message = message
            .with("octopusRoles", &self.role)
            .with("updateIfExisting", flag_token(true))
            .with("isDynamic", flag_token(true))
            .with("awsUseWorkerCredentials", flag_token(self.use_worker_credentials))
            .with("awsAssumeRole", flag_token(self.assumed_role.is_some()));

        if let Some(role) = &self.assumed_role {
            message = message.with("awsAssumeRoleArn", &role.arn);
            if let Some(session) = &role.session_name {
                message = message.with("awsAssumeRoleSession", session);
            }
            if let Some(duration) = role.session_duration {
                message = message.with("awsAssumeRoleSessionDurationSeconds", duration.to_string());
            }
        }
        message
    }
}

/// Finds clusters through a [`ClusterCatalog`] and reports them.
pub struct ClusterDiscoveryEmitter<'a> {
    catalog: &'a dyn ClusterCatalog,
    log: &'a dyn DeploymentLog,
}

impl<'a> ClusterDiscoveryEmitter<'a> {
    /// Emitter writing to `log`
    pub fn new(catalog: &'a dyn ClusterCatalog, log: &'a dyn DeploymentLog) -> Self {
        Self { catalog, log }
    }

    /// Discover clusters for `context`, writing one service message per match.
    ///
    /// Unusable credentials produce the resolver's single warning and no
    /// catalog calls. A failing region is skipped with a warning.
    pub async fn discover(
        &self,
        context: &TargetDiscoveryContext,
        env: &EnvironmentSnapshot,
    ) -> Vec<DiscoveryEvent> {
        let DiscoveryAuthentication::Aws(details) = &context.authentication;
        let resolved = resolve(&details.config(), env, self.log);
        let Some(identity) = resolved.identity() else {
            return Vec::new();
        };

        let account_id = match identity.source() {
            CredentialSource::Account { account_id } => Some(account_id.clone()),
            CredentialSource::Worker => None,
        };

        let mut events = Vec::new();
        for region in &details.regions {
            let clusters = match self.catalog.list_clusters(identity, region).await {
                Ok(clusters) => clusters,
                Err(e) => {
                    warn!(region = %region, error = %e, "Cluster discovery failed in region");
                    self.log.warn(&format!(
                        "Unable to discover Kubernetes clusters in region {}, see verbose log for details.",
                        region
                    ));
                    self.log.verbose(&format!("Cluster discovery in {} failed: {}", region, e));
                    continue;
                }
            };

            for cluster in clusters {
                let Some(role) = context.scope.match_cluster(&cluster) else {
                    self.log.verbose(&format!(
                        "EKS cluster {} does not match the discovery scope and was skipped",
                        cluster.name
                    ));
                    continue;
                };
                let Some(endpoint) = cluster.endpoint.clone() else {
                    self.log.verbose(&format!(
                        "EKS cluster {} has no endpoint yet and was skipped",
                        cluster.name
                    ));
                    continue;
                };

                let event = DiscoveryEvent {
                    name: cluster.arn.clone(),
                    cluster_name: cluster.name.clone(),
                    cluster_url: endpoint,
                    worker_pool: context.scope.worker_pool_id.clone(),
                    account_id: account_id.clone(),
                    role: role.to_string(),
                    use_worker_credentials: details.config().uses_worker_credentials(),
                    assumed_role: identity.assumed_role().cloned(),
                };
                debug!(cluster = %event.cluster_name, region = %region, "Discovered EKS cluster");
                self.log.service_message(&event.to_service_message());
                events.push(event);
            }
        }

        info!(targets = events.len(), "Target discovery finished");
        events
    }
}
