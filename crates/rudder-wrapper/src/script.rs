//! Script execution
//!
//! The user script sits at the centre of the pipeline. Stages hand it a
//! [`ScriptEnvironment`] and look at its [`CommandResult`] afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use rudder_common::command::{CommandInvocation, CommandRunner};
use rudder_common::Error;

use crate::pipeline::DeploymentContext;

/// Upper bound on a user script run
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Environment variables stages add for the script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptEnvironment {
    vars: BTreeMap<String, String>,
}

impl ScriptEnvironment {
    /// Empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Set several variables
    pub fn extend<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set(k, v);
        }
    }

    /// Value of a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// All variables as owned pairs
    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Outcome of the script, possibly adjusted by stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    /// Process exit code
    pub exit_code: i32,
}

impl CommandResult {
    /// Result with the given exit code
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }

    /// Exit code 0
    pub fn success() -> Self {
        Self::new(0)
    }

    /// Whether the exit code is 0
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Script dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSyntax {
    /// Run with bash
    Bash,
    /// Run with pwsh
    PowerShell,
}

impl ScriptSyntax {
    /// Dialect implied by the file extension (`.ps1` is PowerShell)
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("ps1") => ScriptSyntax::PowerShell,
            _ => ScriptSyntax::Bash,
        }
    }
}

/// Runs the user script.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Execute the script. A non-zero exit is a result, not an error.
    async fn execute(
        &self,
        ctx: &DeploymentContext,
        env: &ScriptEnvironment,
    ) -> Result<CommandResult, Error>;
}

/// [`ScriptExecutor`] running a script file through bash or pwsh.
pub struct ShellScriptExecutor {
    runner: Arc<dyn CommandRunner>,
    script: PathBuf,
    syntax: ScriptSyntax,
    timeout: Duration,
}

impl ShellScriptExecutor {
    /// Executor for `script`, with the dialect taken from its extension
    pub fn new(runner: Arc<dyn CommandRunner>, script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        let syntax = ScriptSyntax::from_path(&script);
        Self {
            runner,
            script,
            syntax,
            timeout: SCRIPT_TIMEOUT,
        }
    }

    /// Force a dialect
    pub fn with_syntax(mut self, syntax: ScriptSyntax) -> Self {
        self.syntax = syntax;
        self
    }

    /// Override the script timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn invocation(&self) -> CommandInvocation {
        let script = self.script.display().to_string();
        match self.syntax {
            ScriptSyntax::Bash => CommandInvocation::new("bash").arg(script),
            ScriptSyntax::PowerShell => CommandInvocation::new("pwsh").args([
                "-NoLogo",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
                script.as_str(),
            ]),
        }
    }
}

#[async_trait]
impl ScriptExecutor for ShellScriptExecutor {
    async fn execute(
        &self,
        ctx: &DeploymentContext,
        env: &ScriptEnvironment,
    ) -> Result<CommandResult, Error> {
        let invocation = self
            .invocation()
            .envs(env.to_vec())
            .working_dir(ctx.working_dir.clone())
            .timeout(self.timeout);

        debug!(script = %self.script.display(), syntax = ?self.syntax, "Running script");
        let output = self.runner.run(&invocation).await?;

        for line in output.stdout.lines() {
            ctx.log.info(line);
        }
        for line in output.stderr.lines() {
            ctx.log.stderr(line);
        }

        info!(exit_code = output.exit_code, "Script finished");
        Ok(CommandResult::new(output.exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_common::command::{CommandOutput, StubRunner};
    use rudder_common::log::{InMemoryLog, LogLevel};
    use rudder_common::variables::VariableSet;

    fn context(log: Arc<InMemoryLog>) -> DeploymentContext {
        DeploymentContext::new(VariableSet::new(), "/work", log)
    }

    #[test]
    fn syntax_follows_extension() {
        assert_eq!(ScriptSyntax::from_path(Path::new("deploy.ps1")), ScriptSyntax::PowerShell);
        assert_eq!(ScriptSyntax::from_path(Path::new("Deploy.PS1")), ScriptSyntax::PowerShell);
        assert_eq!(ScriptSyntax::from_path(Path::new("deploy.sh")), ScriptSyntax::Bash);
        assert_eq!(ScriptSyntax::from_path(Path::new("deploy")), ScriptSyntax::Bash);
    }

    #[test]
    fn later_values_replace_earlier_ones() {
        let mut env = ScriptEnvironment::new();
        env.set("KUBECONFIG", "/a");
        env.extend([("KUBECONFIG", "/b"), ("AWS_REGION", "us-east-1")]);
        assert_eq!(env.get("KUBECONFIG"), Some("/b"));
        assert_eq!(env.to_vec().len(), 2);
    }

    #[tokio::test]
    async fn bash_script_output_reaches_the_log() {
        let stub = Arc::new(StubRunner::new());
        stub.on(
            "bash",
            &[],
            CommandOutput {
                exit_code: 3,
                stdout: "applying\ndone\n".into(),
                stderr: "warning: deprecated\n".into(),
            },
        );
        let log = Arc::new(InMemoryLog::new());
        let mut env = ScriptEnvironment::new();
        env.set("KUBECONFIG", "/work/kubectl-rudder.yaml");

        let result = ShellScriptExecutor::new(stub.clone(), "/work/deploy.sh")
            .execute(&context(log.clone()), &env)
            .await
            .unwrap();

        assert_eq!(result, CommandResult::new(3));
        assert_eq!(log.messages_at(LogLevel::Info), vec!["applying", "done"]);
        assert_eq!(log.stderr_lines(), vec!["warning: deprecated"]);

        let call = &stub.calls()[0];
        assert_eq!(call.args, vec!["/work/deploy.sh"]);
        assert_eq!(call.working_dir.as_deref(), Some(Path::new("/work")));
        assert!(call
            .env
            .contains(&("KUBECONFIG".to_string(), "/work/kubectl-rudder.yaml".to_string())));
    }

    #[tokio::test]
    async fn powershell_scripts_run_with_pwsh() {
        let stub = Arc::new(StubRunner::new());
        let log = Arc::new(InMemoryLog::new());

        let result = ShellScriptExecutor::new(stub.clone(), "/work/deploy.ps1")
            .execute(&context(log), &ScriptEnvironment::new())
            .await
            .unwrap();

        assert!(result.is_success());
        let call = &stub.calls()[0];
        assert_eq!(call.program, "pwsh");
        assert_eq!(call.flag_value("-File"), Some("/work/deploy.ps1"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let stub = Arc::new(StubRunner::new());
        stub.fail("bash", &[], "No such file or directory");
        let log = Arc::new(InMemoryLog::new());

        let err = ShellScriptExecutor::new(stub, "/work/deploy.sh")
            .execute(&context(log), &ScriptEnvironment::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No such file or directory"));
    }
}
