#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eyre::{Context, Result};
use tracing::Level;

use portmux::app::{self, Options};
use portmux::control::{self, DEFAULT_SOCKET};

mod cli;

use self::cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_max_level(level)
        .init();

    match try_main(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    if let Command::Serve { config } = cli.command {
        return app::serve(Options {
            socket: cli.socket,
            config,
        })
        .await;
    }

    let socket = cli.socket.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));
    let context = || format!("request to {} failed", socket.display());

    match cli.command {
        Command::Serve { .. } => {}

        Command::Add { src, dest } => {
            control::add(&socket, src, dest).await.with_context(context)?;
        }

        Command::Del { src } => {
            control::del(&socket, src).await.with_context(context)?;
        }

        Command::List => {
            let mappings = control::list(&socket).await.with_context(context)?;
            for x in mappings {
                println!("{x}");
            }
        }

        Command::Quit => {
            control::quit(&socket).await.with_context(context)?;
        }
    }

    Ok(())
}
