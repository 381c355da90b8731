// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The muster command-line client.

mod client;
mod commands;
mod error;
mod output;

use clap::{Parser, Subcommand};
use error::CliError;

#[derive(Parser)]
#[command(name = "muster", version, about = "Run commands on whatever compute fits")]
struct Cli {
    /// Manager address (host:port)
    #[arg(long, env = "MUSTER_MANAGER", default_value = "127.0.0.1:11301", global = true)]
    manager: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Kill running commands
    Kill(commands::kill::KillArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Kill(args) => commands::kill::run(args, &cli.manager).await,
    };

    if let Err(error) = result {
        let code = error
            .downcast_ref::<CliError>()
            .map(CliError::exit_code)
            .unwrap_or(1);
        output::error(&format!("{:#}", error));
        std::process::exit(code);
    }
}
