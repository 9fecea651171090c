// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-edge token` - cluster token administration against a running
//! server. Rotation invalidates the old token immediately.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

#[derive(Args)]
pub struct TokenArgs {
    /// Supervisor URL of the local server
    #[arg(long, value_name = "URL", default_value = "https://127.0.0.1:6443")]
    server: String,

    /// Current cluster token (read from the data directory when omitted)
    #[arg(long, env = "AEGIS_EDGE_TOKEN")]
    token: Option<String>,

    /// Data directory (used to resolve the token)
    #[arg(long, value_name = "DIR", default_value = "/var/lib/aegis-edge")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: TokenCommand,
}

#[derive(Subcommand)]
pub enum TokenCommand {
    /// Replace the cluster token
    Rotate {
        #[arg(long, value_name = "TOKEN")]
        new_token: String,
    },
}

pub async fn run(args: TokenArgs) -> Result<()> {
    let token = super::admin_token(args.token.clone(), &args.data_dir)?;
    let client = super::admin_client()?;
    let base = args.server.trim_end_matches('/');

    match args.command {
        TokenCommand::Rotate { new_token } => {
            let response = client
                .post(format!("{base}/v1-edge/token/rotate"))
                .bearer_auth(&token)
                .json(&serde_json::json!({ "new_token": new_token }))
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                bail!("{status}: {body}");
            }
            println!(
                "{}",
                "cluster token rotated; joins with the old token now fail".green()
            );
        }
    }
    Ok(())
}
