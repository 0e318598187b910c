//! AWS authentication payloads
//!
//! The deployment server describes how to authenticate as JSON with a `type`
//! tag at each level. Shapes that can never work (an `account` credential
//! without its `account` object, an unknown tag) are rejected at parse time.
//! Keys that are merely missing or null parse fine and are caught later by
//! the resolver.

use std::fmt;

use serde::{Deserialize, Serialize};

use rudder_common::Error;

/// Static keys of an AWS account
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsAccountKeys {
    /// Access key id
    #[serde(default)]
    pub access_key: Option<String>,
    /// Secret access key
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl fmt::Debug for AwsAccountKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret
        f.debug_struct("AwsAccountKeys")
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where the base credentials come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AwsCredentialsConfig {
    /// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` of the worker environment
    Worker,
    /// Keys stored in a server-side account
    #[serde(rename_all = "camelCase")]
    Account {
        /// Server id of the account
        account_id: String,
        /// The account's keys
        account: AwsAccountKeys,
    },
}

/// Optional role to assume on top of the base credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AwsAssumedRole {
    /// Use the base credentials directly
    NoAssumedRole,
    /// Exchange the base credentials for role credentials
    #[serde(rename_all = "camelCase")]
    AssumeRole {
        /// Role ARN
        arn: String,
        /// Session name (AWS picks one when absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        /// Session duration in seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_duration: Option<u32>,
    },
}

/// Credentials plus optional role: everything needed to resolve an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    /// Base credentials
    pub credentials: AwsCredentialsConfig,
    /// Role overlay
    pub role: AwsAssumedRole,
}

impl AuthenticationConfig {
    /// Worker credentials without a role
    pub fn worker() -> Self {
        Self {
            credentials: AwsCredentialsConfig::Worker,
            role: AwsAssumedRole::NoAssumedRole,
        }
    }

    /// Whether the base credentials come from the worker
    pub fn uses_worker_credentials(&self) -> bool {
        matches!(self.credentials, AwsCredentialsConfig::Worker)
    }

    /// Account id when account credentials are used
    pub fn account_id(&self) -> Option<&str> {
        match &self.credentials {
            AwsCredentialsConfig::Account { account_id, .. } => Some(account_id),
            AwsCredentialsConfig::Worker => None,
        }
    }
}

/// AWS section of a discovery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsAuthenticationDetails {
    /// Base credentials
    pub credentials: AwsCredentialsConfig,
    /// Role overlay
    pub role: AwsAssumedRole,
    /// Regions to search
    #[serde(default)]
    pub regions: Vec<String>,
}

impl AwsAuthenticationDetails {
    /// Credentials and role as an [`AuthenticationConfig`]
    pub fn config(&self) -> AuthenticationConfig {
        AuthenticationConfig {
            credentials: self.credentials.clone(),
            role: self.role.clone(),
        }
    }
}

/// Authentication of a discovery request, tagged by provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryAuthentication {
    /// Amazon Web Services
    Aws(AwsAuthenticationDetails),
}

/// Parse an [`AuthenticationConfig`] from JSON
pub fn parse_authentication(json: &str) -> Result<AuthenticationConfig, Error> {
    serde_json::from_str(json)
        .map_err(|e| Error::serialization_for_kind("AuthenticationConfig", e.to_string()))
}
