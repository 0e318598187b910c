//! Deployment variables
//!
//! The deployment server hands every step a flat, string-keyed variable set.
//! Values are opaque strings; booleans use `True`/`False` tokens and integers
//! are decimal strings. Accessors here do the parsing and turn malformed
//! values into configuration errors that name the variable.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Well-known variable names read by rudder.
pub mod names {
    /// Account type selecting how context setup authenticates
    pub const ACCOUNT_TYPE: &str = "Octopus.Account.AccountType";
    /// Bearer token of a `Token` account
    pub const ACCOUNT_TOKEN: &str = "Octopus.Account.Token";
    /// User name of a `UsernamePassword` account
    pub const ACCOUNT_USERNAME: &str = "Octopus.Account.Username";
    /// Password of a `UsernamePassword` account
    pub const ACCOUNT_PASSWORD: &str = "Octopus.Account.Password";
    /// Name of the account variable prefix (`{account}.AccessKey`, ...)
    pub const AWS_ACCOUNT_VARIABLE: &str = "Octopus.Action.AwsAccount.Variable";
    /// Use credentials from the worker environment instead of an account
    pub const AWS_USE_INSTANCE_ROLE: &str = "Octopus.Action.AwsAccount.UseInstanceRole";
    /// AWS region of the target cluster
    pub const AWS_REGION: &str = "Octopus.Action.Aws.Region";
    /// Whether to assume a role before talking to the cluster
    pub const AWS_ASSUME_ROLE: &str = "Octopus.Action.Aws.AssumeRole";
    /// ARN of the role to assume
    pub const AWS_ASSUMED_ROLE_ARN: &str = "Octopus.Action.Aws.AssumedRoleArn";
    /// Session name for the assumed role
    pub const AWS_ASSUMED_ROLE_SESSION: &str = "Octopus.Action.Aws.AssumedRoleSession";
    /// Session duration, in seconds, for the assumed role
    pub const AWS_ASSUME_ROLE_SESSION_DURATION: &str =
        "Octopus.Action.Aws.AssumeRoleSessionDurationSeconds";

    /// Cluster API server URL
    pub const CLUSTER_URL: &str = "Octopus.Action.Kubernetes.ClusterUrl";
    /// EKS cluster name (used for token generation)
    pub const EKS_CLUSTER_NAME: &str = "Octopus.Action.Kubernetes.EksClusterName";
    /// Name of the certificate variable holding the cluster CA
    pub const CERTIFICATE_AUTHORITY: &str = "Octopus.Action.Kubernetes.CertificateAuthority";
    /// Skip TLS verification of the API server
    pub const SKIP_TLS_VERIFICATION: &str = "Octopus.Action.Kubernetes.SkipTlsVerification";
    /// Path to a kubectl binary to use instead of the one on PATH
    pub const CUSTOM_KUBECTL_EXECUTABLE: &str = "Octopus.Action.Kubernetes.CustomKubectlExecutable";
    /// Namespace the script and status checks default to
    pub const NAMESPACE: &str = "Octopus.Action.KubernetesContainers.Namespace";

    /// Enables the resource status check after the script
    pub const RESOURCE_STATUS_CHECK: &str = "Octopus.Action.Kubernetes.ResourceStatusCheck";
    /// Hard ceiling, in seconds, on a status-check session
    pub const DEPLOYMENT_TIMEOUT: &str = "Octopus.Action.Kubernetes.DeploymentTimeout";
    /// Seconds a resource may stay unready before it counts as failed
    pub const STABILIZATION_TIMEOUT: &str = "Octopus.Action.Kubernetes.StabilizationTimeout";
    /// Manifest file(s) whose resources are tracked
    pub const CUSTOM_RESOURCE_YAML_FILE_NAME: &str =
        "Octopus.Action.KubernetesContainers.CustomResourceYamlFileName";

    /// JSON discovery request (scope + authentication)
    pub const TARGET_DISCOVERY_CONTEXT: &str = "Octopus.TargetDiscovery.Context";

    /// Action id stamped on status events
    pub const ACTION_ID: &str = "Octopus.Action.Id";
    /// Step name stamped on status events
    pub const STEP_NAME: &str = "Octopus.Step.Name";
    /// Task id stamped on status events
    pub const TASK_ID: &str = "Octopus.Task.Id";
    /// Deployment target id stamped on status events
    pub const MACHINE_ID: &str = "Octopus.Machine.Id";
    /// Space id stamped on status events
    pub const SPACE_ID: &str = "Octopus.Space.Id";
}

/// A string-keyed deployment variable set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableSet {
    values: BTreeMap<String, String>,
}

impl VariableSet {
    /// Create an empty variable set
    pub fn new() -> Self {
        Self::default()
    }

    /// Load variables from a JSON object of string values.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::serialization_for_kind("variables", e.to_string()))
    }

    /// Load variables from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Get a variable. Empty values are treated as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Get a variable or a default
    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Whether a variable is set to a non-empty value
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Get a variable that must be present.
    pub fn require(&self, name: &str) -> Result<&str, Error> {
        self.get(name)
            .ok_or_else(|| Error::configuration(name, "variable is required but was not set"))
    }

    /// Parse a `True`/`False` flag (case-insensitive).
    pub fn get_flag(&self, name: &str, default: bool) -> Result<bool, Error> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => parse_flag(raw)
                .ok_or_else(|| Error::configuration(name, format!("'{}' is not True or False", raw))),
        }
    }

    /// Parse a non-negative decimal integer.
    pub fn get_u64(&self, name: &str, default: u64) -> Result<u64, Error> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::configuration(name, format!("'{}' is not a non-negative integer", raw))
            }),
        }
    }

    /// Iterate over all variables in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VariableSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Parse a boolean token the way the deployment server writes them.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Render a boolean as the server's token (`True`/`False`).
pub fn flag_token(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}
