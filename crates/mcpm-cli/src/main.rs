//! Thin CLI wrapper around the aggregation core. Builds one root
//! [`RootApp`] dependency-injection value per invocation and passes it
//! down; no module-level singletons.

mod cli;
mod root;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::from(0),
        Err(error) => {
            if error.downcast_ref::<root::SigintInterrupted>().is_some() {
                return ExitCode::from(130);
            }
            eprintln!("mcpm: {error:#}");
            let code = error
                .downcast_ref::<mcpm_core::Error>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let app = root::RootApp::new(cli.debug, cli.non_interactive, cli.force, cli.json)?;

    match cli.command {
        Command::Run { server, http, bind, port } => root::run(&app, &server, http, bind, port).await,
        Command::ProfileRun { profile, http, bind, port } => {
            root::profile_run(&app, &profile, http, bind, port).await
        }
        Command::Share {
            profile,
            share_host,
            bind,
            port,
        } => root::share(&app, &profile, &share_host, bind, port).await,
        Command::Catalog { command } => root::catalog(&app, command).await,
        Command::Usage { window } => root::usage(&app, &window).await,
    }
}
