//! EKS cluster catalog over the aws CLI
//!
//! Discovery needs the EKS clusters visible to an identity in a region. The
//! [`AwsCliCatalog`] asks the `aws` binary for them, assuming a role first
//! when the identity carries one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use rudder_common::command::{CommandInvocation, CommandOutput, CommandRunner};
use rudder_common::retry::{retry_with_backoff, RetryConfig};
use rudder_common::Error;

use crate::resolver::{AwsIdentity, SESSION_TOKEN_VAR};

/// Session name used when a role is assumed without one
pub const DEFAULT_ROLE_SESSION_NAME: &str = "rudder-target-discovery";

/// Limit on a single aws CLI call
const AWS_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Error codes meaning the credentials themselves are bad
const AUTH_FAILURE_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "ExpiredToken",
];

/// One EKS cluster as described by AWS
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EksCluster {
    /// Cluster name
    pub name: String,
    /// Cluster ARN
    pub arn: String,
    /// API server endpoint (absent while the cluster is being created)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Resource tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Source of EKS clusters for discovery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterCatalog: Send + Sync {
    /// Clusters visible to `identity` in `region`
    async fn list_clusters(&self, identity: &AwsIdentity, region: &str)
        -> Result<Vec<EksCluster>, Error>;
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleOutput {
    credentials: StsCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListClustersOutput {
    #[serde(default)]
    clusters: Vec<String>,
    #[serde(default, alias = "NextToken")]
    next_token: Option<String>,
}

#[derive(Deserialize)]
struct DescribeClusterOutput {
    cluster: EksCluster,
}

/// [`ClusterCatalog`] driving the `aws` CLI.
pub struct AwsCliCatalog {
    runner: Arc<dyn CommandRunner>,
    executable: String,
    retry: RetryConfig,
}

impl AwsCliCatalog {
    /// Catalog using `aws` from PATH
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            executable: "aws".to_string(),
            retry: RetryConfig::with_max_attempts(3),
        }
    }

    /// Use a specific aws executable
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Override retry behaviour for describe calls
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn aws(&self, env: &[(String, String)], args: &[&str]) -> Result<String, Error> {
        let invocation = CommandInvocation::new(&self.executable)
            .args(args.iter().copied())
            .args(["--output", "json"])
            .envs(env.iter().cloned())
            .timeout(AWS_COMMAND_TIMEOUT);
        let output = self.runner.run(&invocation).await?;
        classify(&self.executable, output)
    }

    /// Credentials to use for EKS calls, after assuming the role if any
    async fn effective_env(
        &self,
        identity: &AwsIdentity,
        region: &str,
    ) -> Result<Vec<(String, String)>, Error> {
        let region_env = [
            ("AWS_REGION".to_string(), region.to_string()),
            ("AWS_DEFAULT_REGION".to_string(), region.to_string()),
        ];
        let mut env = identity.environment();
        env.extend(region_env.iter().cloned());

        let Some(role) = identity.assumed_role() else {
            return Ok(env);
        };

        let session_name = role
            .session_name
            .as_deref()
            .unwrap_or(DEFAULT_ROLE_SESSION_NAME);
        let duration = role.session_duration.map(|d| d.to_string());
        let mut args = vec![
            "sts",
            "assume-role",
            "--role-arn",
            role.arn.as_str(),
            "--role-session-name",
            session_name,
        ];
        if let Some(duration) = duration.as_deref() {
            args.extend(["--duration-seconds", duration]);
        }

        debug!(role_arn = %role.arn, "Assuming role for cluster discovery");
        let stdout = self.aws(&env, &args).await?;
        let assumed: AssumeRoleOutput = serde_json::from_str(&stdout)
            .map_err(|e| Error::serialization_for_kind("AssumeRoleOutput", e.to_string()))?;

        let creds = assumed.credentials;
        let mut env = vec![
            ("AWS_ACCESS_KEY_ID".to_string(), creds.access_key_id),
            ("AWS_SECRET_ACCESS_KEY".to_string(), creds.secret_access_key),
            (SESSION_TOKEN_VAR.to_string(), creds.session_token),
        ];
        env.extend(region_env);
        Ok(env)
    }

    /// Every cluster name in `region`, following `nextToken` across pages
    async fn cluster_names(
        &self,
        env: &[(String, String)],
        region: &str,
    ) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut args = vec!["eks", "list-clusters", "--region", region];
            if let Some(token) = token.as_deref() {
                args.extend(["--starting-token", token]);
            }
            let stdout = self.aws(env, &args).await?;
            let page: ListClustersOutput = serde_json::from_str(&stdout)
                .map_err(|e| Error::serialization_for_kind("ListClustersOutput", e.to_string()))?;
            names.extend(page.clusters);
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                _ => break,
            }
        }
        debug!(region = %region, clusters = names.len(), "Listed EKS cluster names");
        Ok(names)
    }
}

/// Turn a finished aws call into stdout or a classified error
fn classify(program: &str, output: CommandOutput) -> Result<String, Error> {
    if !output.success() && AUTH_FAILURE_CODES.iter().any(|c| output.stderr.contains(c)) {
        return Err(Error::authentication(output.stderr.trim().to_string()));
    }
    output.into_stdout(program)
}

#[async_trait]
impl ClusterCatalog for AwsCliCatalog {
    async fn list_clusters(
        &self,
        identity: &AwsIdentity,
        region: &str,
    ) -> Result<Vec<EksCluster>, Error> {
        let env = self.effective_env(identity, region).await?;

        let names = self.cluster_names(&env, region).await?;

        let mut clusters = Vec::with_capacity(names.len());
        for name in &names {
            let args = ["eks", "describe-cluster", "--name", name.as_str(), "--region", region];
            let stdout =
                retry_with_backoff(&self.retry, "eks_describe_cluster", || self.aws(&env, &args))
                    .await?;
            let described: DescribeClusterOutput = serde_json::from_str(&stdout)
                .map_err(|e| Error::serialization_for_kind("DescribeClusterOutput", e.to_string()))?;
            clusters.push(described.cluster);
        }

        info!(region = %region, clusters = clusters.len(), "Listed EKS clusters");
        Ok(clusters)
    }
}
