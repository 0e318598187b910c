//! Resource queries over kubectl

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use rudder_common::command::{CommandInvocation, CommandRunner};
use rudder_common::Error;

use crate::resource::ResourceIdentifier;

/// Default per-call limit for a kubectl query
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads live resources from the cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceQuery: Send + Sync {
    /// Fetch one resource. `Ok(None)` means it does not exist.
    async fn get(&self, id: &ResourceIdentifier) -> Result<Option<Value>, Error>;

    /// List every resource of `kind` in `namespace`
    async fn list(&self, kind: &str, namespace: &str) -> Result<Vec<Value>, Error>;
}

/// [`ResourceQuery`] running `kubectl get ... -o json`.
pub struct KubectlGet {
    runner: Arc<dyn CommandRunner>,
    executable: String,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl KubectlGet {
    /// Query with the given runner and kubectl executable
    pub fn new(runner: Arc<dyn CommandRunner>, executable: impl Into<String>) -> Self {
        Self {
            runner,
            executable: executable.into(),
            env: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Environment for every kubectl call (e.g. `KUBECONFIG`)
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Working directory for every kubectl call
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn invocation<I, S>(&self, args: I) -> CommandInvocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inv = CommandInvocation::new(&self.executable)
            .args(args)
            .envs(self.env.iter().cloned())
            .timeout(self.timeout);
        if let Some(dir) = &self.working_dir {
            inv = inv.working_dir(dir.clone());
        }
        inv
    }

    async fn run_json(&self, resource: &str, inv: CommandInvocation) -> Result<Option<Value>, Error> {
        let output = self
            .runner
            .run(&inv)
            .await
            .map_err(|e| Error::query(resource, e.to_string()))?;
        if !output.success() {
            return Err(Error::query(
                resource,
                format!("kubectl exited with status {}: {}", output.exit_code, output.stderr.trim()),
            ));
        }
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(stdout)
            .map(Some)
            .map_err(|e| Error::query(resource, format!("malformed kubectl output: {}", e)))
    }
}

#[async_trait]
impl ResourceQuery for KubectlGet {
    async fn get(&self, id: &ResourceIdentifier) -> Result<Option<Value>, Error> {
        trace!(resource = %id, namespace = %id.namespace, "kubectl get");
        let inv = self.invocation([
            "get",
            id.kind.as_str(),
            id.name.as_str(),
            "-n",
            id.namespace.as_str(),
            "-o",
            "json",
            "--ignore-not-found",
        ]);
        self.run_json(&id.to_string(), inv).await
    }

    async fn list(&self, kind: &str, namespace: &str) -> Result<Vec<Value>, Error> {
        trace!(kind = %kind, namespace = %namespace, "kubectl list");
        let inv = self.invocation(["get", kind, "-n", namespace, "-o", "json"]);
        let list = self.run_json(kind, inv).await?;
        Ok(list
            .and_then(|mut l| match l.get_mut("items").map(Value::take) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default())
    }
}
