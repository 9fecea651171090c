// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-edge snapshot` - save/ls/delete/prune/restore for the embedded
//! datastore. Restore requires the server to be stopped.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;

use aegis_edge_core::application::snapshot::SnapshotManager;

#[derive(Args)]
pub struct SnapshotArgs {
    /// Data directory
    #[arg(long, value_name = "DIR", default_value = "/var/lib/aegis-edge")]
    data_dir: PathBuf,

    /// Datastore endpoint (must select the embedded datastore)
    #[arg(long, value_name = "ENDPOINT", default_value = "")]
    datastore_endpoint: String,

    #[command(subcommand)]
    command: SnapshotCommand,
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// Take a consistent snapshot of the embedded datastore
    Save {
        /// Snapshot name (timestamped when omitted)
        name: Option<String>,
    },
    /// List snapshots
    Ls,
    /// Delete a snapshot
    Delete { name: String },
    /// Delete all but the newest N snapshots
    Prune {
        #[arg(long, default_value = "5")]
        retention: usize,
    },
    /// Replace the datastore with a snapshot (server must be stopped)
    Restore { name: String },
}

pub async fn run(args: SnapshotArgs) -> Result<()> {
    let manager = SnapshotManager::new(&args.data_dir, &args.datastore_endpoint)?;
    match args.command {
        SnapshotCommand::Save { name } => {
            let info = manager.save(name).await?;
            println!(
                "{} {} ({} bytes)",
                "saved".green(),
                info.name,
                info.size_bytes
            );
        }
        SnapshotCommand::Ls => {
            let snapshots = manager.list()?;
            if snapshots.is_empty() {
                println!("{}", "no snapshots".dimmed());
                return Ok(());
            }
            println!("{:<40} {:>12} {}", "NAME".bold(), "SIZE".bold(), "CREATED".bold());
            for snapshot in snapshots {
                println!(
                    "{:<40} {:>12} {}",
                    snapshot.name,
                    snapshot.size_bytes,
                    snapshot.created_at.to_rfc3339()
                );
            }
        }
        SnapshotCommand::Delete { name } => {
            manager.delete(&name)?;
            println!("{} {}", "deleted".green(), name);
        }
        SnapshotCommand::Prune { retention } => {
            let removed = manager.prune(retention)?;
            match removed.len() {
                0 => println!("{}", "nothing to prune".dimmed()),
                n => println!("{} {} snapshot(s): {}", "pruned".green(), n, removed.join(", ")),
            }
        }
        SnapshotCommand::Restore { name } => {
            manager.restore(&name)?;
            println!(
                "{} {}; other servers of a shared datastore must be wiped and rejoined",
                "restored".green(),
                name
            );
        }
    }
    Ok(())
}
