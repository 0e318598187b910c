//! Kubernetes context setup
//!
//! Builds a kubeconfig in the working directory so the script's `kubectl`
//! talks to the deployment's cluster with the deployment's credentials:
//!
//! 1. `set-cluster` with the server URL and CA (or insecure TLS)
//! 2. `set-credentials` for the account type (AWS exec plugin, token,
//!    username/password, or nothing). Tokens and passwords are written
//!    straight into the kubeconfig, never onto a command line.
//! 3. `set-context` with the namespace, then `use-context`
//!
//! A cluster that cannot be reached is only a warning: the script may be
//! the thing that brings it up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use rudder_aws::{resolve, AuthenticationConfig, AwsAccountKeys, AwsAssumedRole, AwsCredentialsConfig, ResolvedIdentity};
use rudder_common::command::{CommandInvocation, CommandRunner};
use rudder_common::variables::{names, VariableSet};
use rudder_common::{yaml, Error};

use crate::pipeline::DeploymentContext;
use crate::script::{CommandResult, ScriptEnvironment};
use crate::stage::Next;

/// Kubeconfig written into the working directory
pub const KUBECONFIG_FILE_NAME: &str = "kubectl-rudder.yaml";
/// Cluster CA written next to the kubeconfig
pub const CA_FILE_NAME: &str = "kubectl-rudder-ca.pem";

const CLUSTER_NAME: &str = "rudder-cluster";
const USER_NAME: &str = "rudder-user";
const CONTEXT_NAME: &str = "rudder-context";

/// Exec credential API version understood by `aws eks get-token`
const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

/// Limit on the reachability probe
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(10);

const KUBECTL_CONFIG_TIMEOUT: Duration = Duration::from_secs(30);

/// Account types the stage knows how to configure
const AWS_ACCOUNT: &str = "AmazonWebServicesAccount";
const TOKEN_ACCOUNT: &str = "Token";
const USERNAME_PASSWORD_ACCOUNT: &str = "UsernamePassword";

/// kubectl executable for a deployment: the custom one if configured
/// (resolved against the working directory), otherwise `kubectl`.
pub fn kubectl_executable(variables: &VariableSet, working_dir: &Path) -> Result<String, Error> {
    match variables.get(names::CUSTOM_KUBECTL_EXECUTABLE) {
        None => Ok("kubectl".to_string()),
        Some(custom) => {
            let path = working_dir.join(custom);
            if !path.is_file() {
                return Err(Error::configuration(
                    names::CUSTOM_KUBECTL_EXECUTABLE,
                    format!("the custom kubectl executable {} does not exist", path.display()),
                ));
            }
            Ok(path.display().to_string())
        }
    }
}

/// AWS authentication described by the deployment variables
pub fn aws_authentication(variables: &VariableSet) -> Result<AuthenticationConfig, Error> {
    let credentials = if variables.get_flag(names::AWS_USE_INSTANCE_ROLE, false)? {
        AwsCredentialsConfig::Worker
    } else {
        let account = variables.require(names::AWS_ACCOUNT_VARIABLE)?;
        AwsCredentialsConfig::Account {
            account_id: account.to_string(),
            account: AwsAccountKeys {
                access_key: variables.get(&format!("{}.AccessKey", account)).map(str::to_string),
                secret_key: variables.get(&format!("{}.SecretKey", account)).map(str::to_string),
            },
        }
    };

    let role = if variables.get_flag(names::AWS_ASSUME_ROLE, false)? {
        let session_duration = match variables.get(names::AWS_ASSUME_ROLE_SESSION_DURATION) {
            None => None,
            Some(_) => {
                let secs = variables.get_u64(names::AWS_ASSUME_ROLE_SESSION_DURATION, 0)?;
                Some(u32::try_from(secs).map_err(|_| {
                    Error::configuration(
                        names::AWS_ASSUME_ROLE_SESSION_DURATION,
                        format!("{} seconds is too long for a role session", secs),
                    )
                })?)
            }
        };
        AwsAssumedRole::AssumeRole {
            arn: variables.require(names::AWS_ASSUMED_ROLE_ARN)?.to_string(),
            session_name: variables
                .get(names::AWS_ASSUMED_ROLE_SESSION)
                .map(str::to_string),
            session_duration,
        }
    } else {
        AwsAssumedRole::NoAssumedRole
    };

    Ok(AuthenticationConfig { credentials, role })
}

/// Writes the kubeconfig and exports it to the script.
pub struct ContextSetupStage {
    runner: Arc<dyn CommandRunner>,
}

impl ContextSetupStage {
    /// Stage running kubectl through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Enabled when the deployment names a cluster
    pub fn is_enabled(&self, ctx: &DeploymentContext) -> bool {
        ctx.variables.is_set(names::CLUSTER_URL) || ctx.variables.is_set(names::EKS_CLUSTER_NAME)
    }

    /// Configure the context, probe the cluster and run `next`
    pub async fn wrap(
        &self,
        ctx: &DeploymentContext,
        mut env: ScriptEnvironment,
        next: Next<'_>,
    ) -> Result<CommandResult, Error> {
        let kubectl = kubectl_executable(&ctx.variables, &ctx.working_dir)?;
        let cluster_url = ctx.variables.require(names::CLUSTER_URL)?.to_string();
        let namespace = ctx.namespace().to_string();

        let kubeconfig = ctx.working_dir.join(KUBECONFIG_FILE_NAME);
        // start from an empty file so nothing from an earlier run leaks in
        tokio::fs::write(&kubeconfig, "").await?;
        env.set("KUBECONFIG", kubeconfig.display().to_string());

        ctx.log.verbose(&format!(
            "Creating kubectl context to {} using namespace {}",
            cluster_url, namespace
        ));

        let kubectl = Kubectl {
            runner: self.runner.as_ref(),
            executable: &kubectl,
            working_dir: &ctx.working_dir,
        };

        let mut cluster_args = vec![
            "config".to_string(),
            "set-cluster".to_string(),
            CLUSTER_NAME.to_string(),
            format!("--server={}", cluster_url),
        ];
        cluster_args.extend(self.tls_args(ctx).await?);
        kubectl.config(&env, cluster_args).await?;

        let credentials = self.user_credentials(ctx, &mut env)?;
        let credential_args = match &credentials {
            UserCredentials::None => None,
            UserCredentials::Exec(args) => Some(args.clone()),
            UserCredentials::Static(secrets) => Some(
                secrets
                    .username
                    .iter()
                    .map(|u| format!("--username={}", u))
                    .collect(),
            ),
        };
        if let Some(credential_args) = credential_args {
            let mut args = vec![
                "config".to_string(),
                "set-credentials".to_string(),
                USER_NAME.to_string(),
            ];
            args.extend(credential_args);
            kubectl.config(&env, args).await?;
        }

        kubectl
            .config(
                &env,
                vec![
                    "config".to_string(),
                    "set-context".to_string(),
                    CONTEXT_NAME.to_string(),
                    format!("--cluster={}", CLUSTER_NAME),
                    format!("--user={}", USER_NAME),
                    format!("--namespace={}", namespace),
                ],
            )
            .await?;
        kubectl
            .config(
                &env,
                vec![
                    "config".to_string(),
                    "use-context".to_string(),
                    CONTEXT_NAME.to_string(),
                ],
            )
            .await?;

        if let UserCredentials::Static(secrets) = &credentials {
            write_user_secrets(&kubeconfig, secrets).await?;
        }

        if let Err(e) = kubectl.probe(&env).await {
            warn!(cluster = %cluster_url, error = %e, "Cluster is not reachable");
            ctx.log.warn(&format!(
                "Unable to reach the Kubernetes cluster at {}; the script will still run.",
                cluster_url
            ));
            ctx.log.verbose(&e.to_string());
        }

        next.run(env).await
    }

    async fn tls_args(&self, ctx: &DeploymentContext) -> Result<Vec<String>, Error> {
        if let Some(ca) = ctx.variables.get(names::CERTIFICATE_AUTHORITY) {
            let pem_variable = format!("{}.CertificatePem", ca);
            let pem = ctx.variables.require(&pem_variable)?;
            let path: PathBuf = ctx.working_dir.join(CA_FILE_NAME);
            tokio::fs::write(&path, pem).await?;
            return Ok(vec![
                format!("--certificate-authority={}", path.display()),
                "--embed-certs=true".to_string(),
            ]);
        }
        if ctx.variables.get_flag(names::SKIP_TLS_VERIFICATION, false)? {
            return Ok(vec!["--insecure-skip-tls-verify=true".to_string()]);
        }
        Ok(Vec::new())
    }

    /// Kubeconfig user for the account type; also exports AWS credentials to
    /// the script when they resolve
    fn user_credentials(
        &self,
        ctx: &DeploymentContext,
        env: &mut ScriptEnvironment,
    ) -> Result<UserCredentials, Error> {
        let vars = &ctx.variables;
        match vars.get(names::ACCOUNT_TYPE) {
            None => Ok(UserCredentials::None),
            Some(AWS_ACCOUNT) => {
                let cluster_name = vars.require(names::EKS_CLUSTER_NAME)?;
                let region = vars.require(names::AWS_REGION)?;
                let config = aws_authentication(vars)?;

                let identity = match resolve(&config, &ctx.environment, ctx.log.as_ref()) {
                    ResolvedIdentity::Resolved(identity) => identity,
                    ResolvedIdentity::Unresolved { .. } => return Ok(UserCredentials::None),
                };
                env.extend(identity.environment());
                env.set("AWS_REGION", region);
                env.set("AWS_DEFAULT_REGION", region);

                let mut exec_args = vec!["eks", "get-token", "--cluster-name", cluster_name, "--region", region];
                if let Some(role) = identity.assumed_role() {
                    exec_args.extend(["--role-arn", role.arn.as_str()]);
                }
                let mut args = vec![
                    "--exec-command=aws".to_string(),
                    format!("--exec-api-version={}", EXEC_API_VERSION),
                ];
                args.extend(exec_args.into_iter().map(|a| format!("--exec-arg={}", a)));
                debug!(cluster = %cluster_name, region = %region, "Configured EKS token exec plugin");
                Ok(UserCredentials::Exec(args))
            }
            Some(TOKEN_ACCOUNT) => Ok(UserCredentials::Static(UserSecrets {
                token: Some(Zeroizing::new(vars.require(names::ACCOUNT_TOKEN)?.to_string())),
                username: None,
                password: None,
            })),
            Some(USERNAME_PASSWORD_ACCOUNT) => Ok(UserCredentials::Static(UserSecrets {
                token: None,
                username: Some(vars.require(names::ACCOUNT_USERNAME)?.to_string()),
                password: Some(Zeroizing::new(vars.require(names::ACCOUNT_PASSWORD)?.to_string())),
            })),
            Some(other) => Err(Error::configuration(
                names::ACCOUNT_TYPE,
                format!("account type {} is not supported for Kubernetes", other),
            )),
        }
    }
}

/// How the kubeconfig user authenticates
enum UserCredentials {
    None,
    /// `set-credentials` exec plugin arguments
    Exec(Vec<String>),
    /// Written into the kubeconfig file after kubectl has created the user
    Static(UserSecrets),
}

struct UserSecrets {
    token: Option<Zeroizing<String>>,
    username: Option<String>,
    password: Option<Zeroizing<String>>,
}

impl fmt::Debug for UserSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSecrets")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Put the token or password on the kubeconfig user entry.
///
/// kubectl reads JSON kubeconfigs, so the file is rewritten as JSON with
/// every other entry kept.
async fn write_user_secrets(kubeconfig: &Path, secrets: &UserSecrets) -> Result<(), Error> {
    let existing = tokio::fs::read_to_string(kubeconfig).await?;
    let mut config = match yaml::parse_document(&existing)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return Err(Error::serialization_for_kind(
                "Kubeconfig",
                format!("{} is not a mapping", kubeconfig.display()),
            ))
        }
    };

    let users = config
        .entry("users")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !users.is_array() {
        *users = Value::Array(Vec::new());
    }
    let Value::Array(users) = users else {
        return Err(Error::internal_with_context("kubeconfig", "users is not a list"));
    };
    let index = match users.iter().position(|u| u["name"] == USER_NAME) {
        Some(index) => index,
        None => {
            users.push(json!({"name": USER_NAME, "user": {}}));
            users.len() - 1
        }
    };
    let entry = &mut users[index];
    if !entry["user"].is_object() {
        entry["user"] = json!({});
    }
    let user = &mut entry["user"];
    if let Some(token) = &secrets.token {
        user["token"] = Value::String(token.as_str().to_string());
    }
    if let Some(username) = &secrets.username {
        user["username"] = Value::String(username.clone());
    }
    if let Some(password) = &secrets.password {
        user["password"] = Value::String(password.as_str().to_string());
    }

    let rendered = Zeroizing::new(
        serde_json::to_string_pretty(&Value::Object(config))
            .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))?,
    );
    tokio::fs::write(kubeconfig, rendered.as_bytes()).await?;
    restrict_to_owner(kubeconfig).await?;
    debug!(user = USER_NAME, "Wrote static credentials into the kubeconfig");
    Ok(())
}

#[cfg(unix)]
async fn restrict_to_owner(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_to_owner(_path: &Path) -> Result<(), Error> {
    Ok(())
}

struct Kubectl<'a> {
    runner: &'a dyn CommandRunner,
    executable: &'a str,
    working_dir: &'a Path,
}

impl Kubectl<'_> {
    fn invocation(&self, env: &ScriptEnvironment, args: Vec<String>) -> CommandInvocation {
        CommandInvocation::new(self.executable)
            .args(args)
            .envs(env.to_vec())
            .working_dir(self.working_dir)
    }

    async fn config(&self, env: &ScriptEnvironment, args: Vec<String>) -> Result<(), Error> {
        let invocation = self.invocation(env, args).timeout(KUBECTL_CONFIG_TIMEOUT);
        let output = self.runner.run(&invocation).await?;
        output.into_stdout(self.executable)?;
        Ok(())
    }

    async fn probe(&self, env: &ScriptEnvironment) -> Result<(), Error> {
        let invocation = self
            .invocation(
                env,
                vec![
                    "version".to_string(),
                    "-o".to_string(),
                    "json".to_string(),
                    format!("--request-timeout={}s", REACHABILITY_TIMEOUT.as_secs()),
                ],
            )
            .timeout(REACHABILITY_TIMEOUT + Duration::from_secs(5));
        let output = self.runner.run(&invocation).await?;
        output.into_stdout(self.executable)?;
        Ok(())
    }
}
