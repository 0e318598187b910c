//! Rudder CLI
//!
//! Runs deployment scripts inside the rudder wrapper pipeline.

use std::process::ExitCode;

use clap::Parser;

use rudder_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = cli.init_telemetry() {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match cli.run().await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!(error = %e, "rudder failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
