// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Edge
//!
//! One binary, two roles:
//!
//! - `aegis-edge server` boots a control plane: datastore, KV bridge, PKI,
//!   node registrar and reverse-tunnel server, all in-process.
//! - `aegis-edge agent` joins a node to a cluster: registers with a server,
//!   installs the node credential, supervises the container runtime and
//!   keeps tunnels to every control-plane endpoint.
//!
//! Administrative commands (`snapshot`, `secrets-encrypt`, `certificate`,
//! `token`) operate on the data directory or on a running server's
//! supervisor API.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{
    AgentArgs, CertificateCommand, SecretsEncryptArgs, ServerArgs, SnapshotArgs, TokenArgs,
};

/// AEGIS Edge - lightweight cluster control plane and node agent
#[derive(Parser)]
#[command(name = "aegis-edge")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AEGIS_EDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a control-plane server
    #[command(name = "server")]
    Server(ServerArgs),

    /// Run a node agent
    #[command(name = "agent")]
    Agent(AgentArgs),

    /// Datastore snapshot lifecycle (embedded datastore only)
    #[command(name = "snapshot")]
    Snapshot(SnapshotArgs),

    /// Inspect or advance encryption-at-rest key rotation
    #[command(name = "secrets-encrypt")]
    SecretsEncrypt(SecretsEncryptArgs),

    /// Certificate rotation (server must be stopped)
    #[command(name = "certificate")]
    Certificate {
        #[command(subcommand)]
        command: CertificateCommand,
    },

    /// Cluster token administration
    #[command(name = "token")]
    Token(TokenArgs),
}

#[tokio::main]
async fn main() {
    // Local overrides from .env, ignored when absent.
    dotenvy::dotenv().ok();
    // Pin the TLS crypto provider before any rustls config is built.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        eprintln!("aegis-edge: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Agent(args) => commands::agent::run(args).await,
        Commands::Snapshot(args) => commands::snapshot::run(args).await,
        Commands::SecretsEncrypt(args) => commands::secrets::run(args).await,
        Commands::Certificate { command } => commands::certificate::run(command),
        Commands::Token(args) => commands::token::run(args).await,
    }
}
