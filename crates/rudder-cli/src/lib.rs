//! Rudder CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand, ValueEnum};

use rudder_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Rudder - Kubernetes deployment script wrapper
#[derive(Parser, Debug)]
#[command(name = "rudder")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Format of diagnostic output on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Plain, env = "RUDDER_LOG_FORMAT")]
    pub log_format: LogFormatArg,

    /// Include debug diagnostics
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Diagnostic output format
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a deployment script inside the wrapper pipeline
    RunScript(commands::run_script::RunScriptArgs),
    /// Discover Kubernetes targets from the discovery context
    Discover(commands::discover::DiscoverArgs),
    /// Check the status of the resources in the given manifests
    CheckStatus(commands::check_status::CheckStatusArgs),
}

impl Cli {
    /// Install the tracing subscriber for this invocation
    pub fn init_telemetry(&self) -> Result<()> {
        let mut config = TelemetryConfig {
            format: match self.log_format {
                LogFormatArg::Plain => LogFormat::Plain,
                LogFormatArg::Json => LogFormat::Json,
            },
            ..TelemetryConfig::default()
        };
        if self.verbose {
            config = config.verbose();
        }
        init_telemetry(config)?;
        Ok(())
    }

    /// Run the CLI command, returning the process exit code
    pub async fn run(self) -> Result<i32> {
        match self.command {
            Commands::RunScript(args) => commands::run_script::run(args).await,
            Commands::Discover(args) => commands::discover::run(args).await,
            Commands::CheckStatus(args) => commands::check_status::run(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn run_script_arguments() {
        let cli = Cli::try_parse_from([
            "rudder",
            "run-script",
            "--variables",
            "vars.json",
            "--script",
            "deploy.ps1",
            "--syntax",
            "powershell",
        ])
        .unwrap();
        let Commands::RunScript(args) = cli.command else {
            panic!("expected run-script");
        };
        assert_eq!(args.script, PathBuf::from("deploy.ps1"));
        assert_eq!(args.syntax, Some(commands::run_script::SyntaxArg::Powershell));
        assert_eq!(args.working_dir, None);
    }

    #[test]
    fn check_status_takes_several_manifests() {
        let cli = Cli::try_parse_from([
            "rudder",
            "--verbose",
            "check-status",
            "--variables",
            "vars.json",
            "--manifest",
            "a.yaml",
            "--manifest",
            "b.yaml",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::CheckStatus(args) = cli.command else {
            panic!("expected check-status");
        };
        assert_eq!(args.manifests, vec![PathBuf::from("a.yaml"), PathBuf::from("b.yaml")]);
    }

    #[test]
    fn check_status_requires_a_manifest() {
        assert!(Cli::try_parse_from(["rudder", "check-status", "--variables", "vars.json"]).is_err());
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::try_parse_from([
            "rudder",
            "discover",
            "--variables",
            "vars.json",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Json);
    }
}
