//! Run-script command: the full wrapper pipeline around a script

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use tracing::info;

use rudder_aws::{AwsCliCatalog, EnvironmentSnapshot};
use rudder_common::command::{CommandRunner, ProcessRunner};
use rudder_common::log::{ConsoleLog, DeploymentLog};
use rudder_wrapper::{
    ContextSetupStage, DeploymentContext, DiscoveryStage, Pipeline, ScriptSyntax,
    ShellScriptExecutor, StatusReportingStage, WrapperStage,
};

use super::{load_variables, resolve_working_dir};
use crate::Result;

/// Script dialect on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntaxArg {
    Bash,
    Powershell,
}

impl From<SyntaxArg> for ScriptSyntax {
    fn from(arg: SyntaxArg) -> Self {
        match arg {
            SyntaxArg::Bash => ScriptSyntax::Bash,
            SyntaxArg::Powershell => ScriptSyntax::PowerShell,
        }
    }
}

/// Run a deployment script inside the wrapper pipeline
#[derive(Args, Debug)]
pub struct RunScriptArgs {
    /// JSON file of deployment variables
    #[arg(long, env = "RUDDER_VARIABLES")]
    pub variables: PathBuf,

    /// Script to run
    #[arg(long)]
    pub script: PathBuf,

    /// Script dialect (defaults to the file extension)
    #[arg(long, value_enum)]
    pub syntax: Option<SyntaxArg>,

    /// Directory to run in (defaults to the current directory)
    #[arg(long)]
    pub working_dir: Option<PathBuf>,
}

/// Every stage rudder knows, wired to real processes
pub fn build_pipeline(runner: Arc<dyn CommandRunner>, script: ShellScriptExecutor) -> Pipeline {
    Pipeline::new(Arc::new(script))
        .with_stage(WrapperStage::ContextSetup(ContextSetupStage::new(runner.clone())))
        .with_stage(WrapperStage::Discovery(DiscoveryStage::new(Arc::new(
            AwsCliCatalog::new(runner.clone()),
        ))))
        .with_stage(WrapperStage::StatusReporting(StatusReportingStage::new(runner)))
}

pub async fn run(args: RunScriptArgs) -> Result<i32> {
    let variables = load_variables(&args.variables)?;
    let working_dir = resolve_working_dir(args.working_dir)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());

    let mut script = ShellScriptExecutor::new(runner.clone(), args.script);
    if let Some(syntax) = args.syntax {
        script = script.with_syntax(syntax.into());
    }

    let log: Arc<dyn DeploymentLog> = Arc::new(ConsoleLog::new());
    let ctx = DeploymentContext::new(variables, working_dir, log)
        .with_environment(EnvironmentSnapshot::from_process());
    run_script(&ctx, runner, script).await
}

/// Run `script` through every applicable stage; the step's exit code
pub async fn run_script(
    ctx: &DeploymentContext,
    runner: Arc<dyn CommandRunner>,
    script: ShellScriptExecutor,
) -> Result<i32> {
    let result = build_pipeline(runner, script).execute(ctx).await?;
    info!(exit_code = result.exit_code, "Script step finished");
    Ok(result.exit_code)
}
