//! Credential Resolver
//!
//! Turns an [`AuthenticationConfig`] into a usable identity. Resolution is
//! quiet by contract: a missing key produces one fixed warning and a verbose
//! reason, never an error line, and the caller decides what to skip. Worker
//! credentials come from an explicit [`EnvironmentSnapshot`], so resolution
//! never reads or mutates the process environment itself.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;
use zeroize::Zeroizing;

use rudder_common::log::DeploymentLog;

use crate::auth::{AuthenticationConfig, AwsAssumedRole, AwsCredentialsConfig};

/// Warning written whenever credentials cannot be resolved
pub const UNABLE_TO_AUTHORISE: &str = "Unable to authorise credentials, see verbose log for details.";

/// Environment variable holding the access key id
pub const ACCESS_KEY_ID_VAR: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable holding the secret access key
pub const SECRET_ACCESS_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
/// Environment variable holding a session token for temporary credentials
pub const SESSION_TOKEN_VAR: &str = "AWS_SESSION_TOKEN";

/// A point-in-time copy of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current process environment
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    /// Look up a variable; empty values count as absent
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Where a resolved identity's keys came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Worker environment
    Worker,
    /// Server-side account
    Account {
        /// Server id of the account
        account_id: String,
    },
}

/// Role to assume when using the identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedRoleContext {
    /// Role ARN
    pub arn: String,
    /// Session name
    pub session_name: Option<String>,
    /// Session duration in seconds
    pub session_duration: Option<u32>,
}

/// Usable AWS credentials.
#[derive(Clone)]
pub struct AwsIdentity {
    access_key_id: String,
    secret_access_key: Zeroizing<String>,
    session_token: Option<Zeroizing<String>>,
    source: CredentialSource,
    assumed_role: Option<AssumedRoleContext>,
}

impl AwsIdentity {
    /// Build an identity from static keys
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        source: CredentialSource,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            session_token: None,
            source,
            assumed_role: None,
        }
    }

    /// Attach a session token
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(Zeroizing::new(token.into()));
        self
    }

    /// Attach a role to assume
    pub fn with_assumed_role(mut self, role: AssumedRoleContext) -> Self {
        self.assumed_role = Some(role);
        self
    }

    /// Access key id
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Secret access key
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Session token of temporary credentials
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_ref().map(|t| t.as_str())
    }

    /// Where the keys came from
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// Role to assume, if any
    pub fn assumed_role(&self) -> Option<&AssumedRoleContext> {
        self.assumed_role.as_ref()
    }

    /// Environment variables handing these credentials to the aws CLI
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (ACCESS_KEY_ID_VAR.to_string(), self.access_key_id.clone()),
            (
                SECRET_ACCESS_KEY_VAR.to_string(),
                self.secret_access_key.to_string(),
            ),
        ];
        if let Some(token) = &self.session_token {
            env.push((SESSION_TOKEN_VAR.to_string(), token.to_string()));
        }
        env
    }
}

impl fmt::Debug for AwsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsIdentity")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .field("assumed_role", &self.assumed_role)
            .finish()
    }
}

/// Outcome of credential resolution
#[derive(Debug, Clone)]
pub enum ResolvedIdentity {
    /// No usable credentials
    Unresolved {
        /// Why, for the verbose log
        reason: String,
    },
    /// Credentials ready to use
    Resolved(AwsIdentity),
}

impl ResolvedIdentity {
    /// The identity, when resolved
    pub fn identity(&self) -> Option<&AwsIdentity> {
        match self {
            ResolvedIdentity::Resolved(identity) => Some(identity),
            ResolvedIdentity::Unresolved { .. } => None,
        }
    }
}

fn base_identity(
    config: &AuthenticationConfig,
    env: &EnvironmentSnapshot,
) -> Result<AwsIdentity, String> {
    match &config.credentials {
        AwsCredentialsConfig::Worker => {
            let access_key = env
                .get(ACCESS_KEY_ID_VAR)
                .ok_or_else(|| format!("worker credentials require {}", ACCESS_KEY_ID_VAR))?;
            let secret_key = env
                .get(SECRET_ACCESS_KEY_VAR)
                .ok_or_else(|| format!("worker credentials require {}", SECRET_ACCESS_KEY_VAR))?;
            let identity = AwsIdentity::new(access_key, secret_key, CredentialSource::Worker);
            Ok(match env.get(SESSION_TOKEN_VAR) {
                Some(token) => identity.with_session_token(token),
                None => identity,
            })
        }
        AwsCredentialsConfig::Account {
            account_id,
            account,
        } => {
            let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
            let access_key = non_empty(&account.access_key)
                .ok_or_else(|| format!("account {} has no access key", account_id))?;
            let secret_key = non_empty(&account.secret_key)
                .ok_or_else(|| format!("account {} has no secret key", account_id))?;
            Ok(AwsIdentity::new(
                access_key,
                secret_key,
                CredentialSource::Account {
                    account_id: account_id.clone(),
                },
            ))
        }
    }
}

/// Resolve credentials without contacting AWS.
pub fn resolve(
    config: &AuthenticationConfig,
    env: &EnvironmentSnapshot,
    log: &dyn DeploymentLog,
) -> ResolvedIdentity {
    match base_identity(config, env) {
        Ok(identity) => {
            let identity = match &config.role {
                AwsAssumedRole::NoAssumedRole => identity,
                AwsAssumedRole::AssumeRole {
                    arn,
                    session_name,
                    session_duration,
                } => identity.with_assumed_role(AssumedRoleContext {
                    arn: arn.clone(),
                    session_name: session_name.clone(),
                    session_duration: *session_duration,
                }),
            };
            debug!(
                source = ?identity.source(),
                assume_role = identity.assumed_role().is_some(),
                "Resolved AWS credentials"
            );
            ResolvedIdentity::Resolved(identity)
        }
        Err(reason) => {
            log.warn(UNABLE_TO_AUTHORISE);
            log.verbose(&format!("AWS credentials could not be resolved: {}", reason));
            ResolvedIdentity::Unresolved { reason }
        }
    }
}
