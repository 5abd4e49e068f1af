// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! icegate binary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use icegate_logging::CliLoggingArgs;
use icegate_proxy::ProxyConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "icegate", author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingest proxy
    Run {
        /// YAML configuration file
        #[arg(long, env = "ICEGATE_CONFIG")]
        config: Option<PathBuf>,

        /// Override `server.listen_addr`
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override `proxy.master_server`
        #[arg(long)]
        master: Option<String>,
    },
    /// Print the bcrypt hash to put in a user's `password_hash`
    HashPassword { password: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { logging, command } = Cli::parse();

    match command {
        Commands::HashPassword { password } => {
            println!("{}", icegate_domain_types::hash_password(&password)?);
            Ok(())
        }
        Commands::Run {
            config,
            listen,
            master,
        } => {
            logging.init("icegate")?;

            let mut config = match config {
                Some(path) => ProxyConfig::from_file(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => ProxyConfig::default(),
            };
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(master) = master {
                config.proxy.master_server = master;
            }

            let shutdown = CancellationToken::new();
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigint.recv() => info!(signal = "SIGINT", "received shutdown signal"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "received shutdown signal"),
                }
                token.cancel();
            });

            icegate_proxy::run(config, shutdown).await?;
            Ok(())
        }
    }
}
