//! External command execution
//!
//! rudder drives `kubectl`, `aws` and the user's shell as black-box processes.
//! All of them go through [`CommandRunner`] so stages and catalogs can be
//! exercised without the binaries installed.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Default timeout for a single external command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// A fully described process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Executable name or path
    pub program: String,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment
    pub env: Vec<(String, String)>,
    /// Working directory (inherited when `None`)
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit for the process
    pub timeout: Duration,
}

impl CommandInvocation {
    /// Start an invocation of `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set several environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Run in the given directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override the default timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the arguments start with `prefix`
    pub fn args_start_with(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len() && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }

    /// Value following `flag` in the arguments (`--region us-east-1`)
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Short description for logs: program plus the first two arguments
    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().take(2).map(String::as_str));
        parts.join(" ")
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Return stdout if the process succeeded, otherwise a command error
    pub fn into_stdout(self, program: &str) -> Result<String, Error> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(Error::command(
                program,
                format!(
                    "exited with status {}: {}",
                    self.exit_code,
                    self.stderr.trim()
                ),
            ))
        }
    }
}

/// Runs external processes.
///
/// A non-zero exit is not an error at this level; callers decide what a
/// failed exit means. `Err` is reserved for spawn failures and timeouts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the invocation to completion and capture its output
    async fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, Error>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a process runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, Error> {
        let description = invocation.describe();
        debug!(command = %description, "Running command");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(invocation.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(command = %description, timeout = ?invocation.timeout, "Command timed out");
                Error::command(
                    &invocation.program,
                    format!("timed out after {:?}", invocation.timeout),
                )
            })?
            .map_err(|e| {
                warn!(command = %description, error = %e, "Command spawn failed");
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::command_permanent(&invocation.program, format!("failed to execute: {}", e))
                } else {
                    Error::command(&invocation.program, format!("failed to execute: {}", e))
                }
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(command = %description, exit_code, "Command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(any(test, feature = "testing"))]
pub use stub::StubRunner;

#[cfg(any(test, feature = "testing"))]
mod stub {
    use std::collections::VecDeque;
    use std::sync::{Mutex, PoisonError};

    use async_trait::async_trait;

    use super::{CommandInvocation, CommandOutput, CommandRunner};
    use crate::Error;

    enum Reply {
        Output(CommandOutput),
        Fail(String),
    }

    struct Rule {
        program: String,
        prefix: Vec<String>,
        replies: VecDeque<Reply>,
    }

    impl Rule {
        fn matches(&self, invocation: &CommandInvocation) -> bool {
            let program_matches = invocation.program == self.program
                || invocation.program.ends_with(&format!("/{}", self.program));
            let prefix: Vec<&str> = self.prefix.iter().map(String::as_str).collect();
            program_matches && invocation.args_start_with(&prefix)
        }

        // The last reply repeats forever
        fn next(&mut self) -> Result<CommandOutput, Error> {
            let reply = if self.replies.len() > 1 {
                self.replies.pop_front()
            } else {
                None
            };
            let reply = reply.as_ref().or_else(|| self.replies.front());
            match reply {
                Some(Reply::Output(out)) => Ok(out.clone()),
                Some(Reply::Fail(msg)) => Err(Error::command(&self.program, msg.clone())),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }

    /// Scripted [`CommandRunner`] for tests.
    ///
    /// Rules match on program name and argument prefix; the first matching
    /// rule answers. A rule with several replies hands them out in order and
    /// then keeps repeating the last one. Unmatched invocations succeed with
    /// empty output. Every invocation is recorded.
    #[derive(Default)]
    pub struct StubRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<CommandInvocation>>,
    }

    impl StubRunner {
        /// Create a runner with no rules
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&self, program: &str, prefix: &[&str], replies: VecDeque<Reply>) {
            self.rules
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Rule {
                    program: program.to_string(),
                    prefix: prefix.iter().map(|s| s.to_string()).collect(),
                    replies,
                });
        }

        /// Answer matching invocations with `output`
        pub fn on(&self, program: &str, prefix: &[&str], output: CommandOutput) -> &Self {
            self.push(program, prefix, VecDeque::from([Reply::Output(output)]));
            self
        }

        /// Answer matching invocations with successive outputs
        pub fn on_sequence(
            &self,
            program: &str,
            prefix: &[&str],
            outputs: Vec<CommandOutput>,
        ) -> &Self {
            self.push(
                program,
                prefix,
                outputs.into_iter().map(Reply::Output).collect(),
            );
            self
        }

        /// Fail matching invocations with a retryable command error
        pub fn fail(&self, program: &str, prefix: &[&str], message: &str) -> &Self {
            self.push(
                program,
                prefix,
                VecDeque::from([Reply::Fail(message.to_string())]),
            );
            self
        }

        /// Every invocation seen so far
        pub fn calls(&self) -> Vec<CommandInvocation> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Invocations of `program` whose arguments start with `prefix`
        pub fn calls_matching(&self, program: &str, prefix: &[&str]) -> Vec<CommandInvocation> {
            self.calls()
                .into_iter()
                .filter(|c| c.program.ends_with(program) && c.args_start_with(prefix))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, Error> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(invocation.clone());
            let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
            match rules.iter_mut().find(|r| r.matches(invocation)) {
                Some(rule) => rule.next(),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_builder_collects_everything() {
        let inv = CommandInvocation::new("aws")
            .args(["eks", "describe-cluster"])
            .arg("--region")
            .arg("us-east-1")
            .env("AWS_REGION", "us-east-1")
            .working_dir("/tmp/work")
            .timeout(Duration::from_secs(5));

        assert!(inv.args_start_with(&["eks", "describe-cluster"]));
        assert!(!inv.args_start_with(&["eks", "list-clusters"]));
        assert_eq!(inv.flag_value("--region"), Some("us-east-1"));
        assert_eq!(inv.flag_value("--role-arn"), None);
        assert_eq!(inv.describe(), "aws eks describe-cluster");
        assert_eq!(inv.timeout, Duration::from_secs(5));
    }

    #[test]
    fn output_into_stdout_reports_exit_status() {
        assert_eq!(CommandOutput::ok("{}").into_stdout("kubectl").unwrap(), "{}");

        let err = CommandOutput::failed(1, "Forbidden\n")
            .into_stdout("kubectl")
            .unwrap_err();
        assert!(err.to_string().contains("exited with status 1: Forbidden"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn mock_runner_is_usable_as_trait_object() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|inv| inv.program == "kubectl" && inv.args_start_with(&["version"]))
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("{\"serverVersion\":{}}")));

        let runner: &dyn CommandRunner = &mock;
        let out = runner
            .run(&CommandInvocation::new("kubectl").args(["version", "-o", "json"]))
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn stub_runner_replays_sequences_then_repeats_last() {
        let stub = StubRunner::new();
        stub.on_sequence(
            "kubectl",
            &["get", "deployment"],
            vec![CommandOutput::ok(""), CommandOutput::ok("{}")],
        )
        .fail("aws", &["eks"], "throttled");

        let get = CommandInvocation::new("kubectl").args(["get", "deployment", "nginx"]);
        assert_eq!(stub.run(&get).await.unwrap().stdout, "");
        assert_eq!(stub.run(&get).await.unwrap().stdout, "{}");
        assert_eq!(stub.run(&get).await.unwrap().stdout, "{}");

        let eks = CommandInvocation::new("/usr/bin/aws").args(["eks", "list-clusters"]);
        assert!(stub.run(&eks).await.is_err());

        let other = CommandInvocation::new("bash").arg("script.sh");
        assert!(stub.run(&other).await.unwrap().success());

        assert_eq!(stub.calls().len(), 5);
        assert_eq!(stub.calls_matching("kubectl", &["get"]).len(), 3);
    }

    #[tokio::test]
    async fn process_runner_reports_missing_executable_as_permanent() {
        let err = ProcessRunner::new()
            .run(&CommandInvocation::new("rudder-definitely-not-installed"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_exit_code_and_output() {
        let out = ProcessRunner::new()
            .run(
                &CommandInvocation::new("sh")
                    .args(["-c", "echo \"$GREETING\"; echo err >&2; exit 3"])
                    .env("GREETING", "hello"),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "err");
    }
}
