// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-edge secrets-encrypt` - drive the encryption-at-rest rotation
//! state machine on a running server.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use aegis_edge_core::application::encryption::EncryptionStatus;

#[derive(Args)]
pub struct SecretsEncryptArgs {
    /// Supervisor URL of the local server
    #[arg(long, value_name = "URL", default_value = "https://127.0.0.1:6443")]
    server: String,

    /// Cluster token (read from the data directory when omitted)
    #[arg(long, env = "AEGIS_EDGE_TOKEN")]
    token: Option<String>,

    /// Data directory (used to resolve the token)
    #[arg(long, value_name = "DIR", default_value = "/var/lib/aegis-edge")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: SecretsEncryptCommand,
}

#[derive(Subcommand)]
pub enum SecretsEncryptCommand {
    /// Report the rotation stage and key count
    Status,
    /// Append a new key to the ring; writers keep the old key
    Prepare,
    /// Switch writers to the new key
    Rotate,
    /// Rewrite every confidential object under the new key
    Reencrypt,
}

pub async fn run(args: SecretsEncryptArgs) -> Result<()> {
    let token = super::admin_token(args.token.clone(), &args.data_dir)?;
    let client = super::admin_client()?;
    let base = args.server.trim_end_matches('/');

    let response = match args.command {
        SecretsEncryptCommand::Status => {
            client
                .get(format!("{base}/v1-edge/encrypt/status"))
                .bearer_auth(&token)
                .send()
                .await?
        }
        SecretsEncryptCommand::Prepare => {
            client
                .post(format!("{base}/v1-edge/encrypt/prepare"))
                .bearer_auth(&token)
                .send()
                .await?
        }
        SecretsEncryptCommand::Rotate => {
            client
                .post(format!("{base}/v1-edge/encrypt/rotate"))
                .bearer_auth(&token)
                .send()
                .await?
        }
        SecretsEncryptCommand::Reencrypt => {
            client
                .post(format!("{base}/v1-edge/encrypt/reencrypt"))
                .bearer_auth(&token)
                .send()
                .await?
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("{status}: {body}");
    }
    let status: EncryptionStatus = response.json().await?;
    print_status(&status);
    Ok(())
}

fn print_status(status: &EncryptionStatus) {
    let enabled = if status.enabled {
        "Enabled".green()
    } else {
        "Disabled".red()
    };
    println!("Encryption Status: {enabled}");
    println!("Current Rotation Stage: {}", status.stage);
    println!("Active Keys: {}", status.key_count);
    if let Some(write_key) = &status.write_key {
        println!("Write Key: {write_key}");
    }
}
