// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-edge certificate` - rotate leaf certificates or the certificate
//! authorities. Operates directly on the data directory; the exclusive
//! directory lock refuses to run while a server holds it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use aegis_edge_core::infrastructure::pki::{CaKind, SecretsManager};

#[derive(Subcommand)]
pub enum CertificateCommand {
    /// Regenerate every leaf certificate under the existing CAs
    Rotate {
        #[arg(long, value_name = "DIR", default_value = "/var/lib/aegis-edge")]
        data_dir: PathBuf,

        /// Subject-alternative names for the regenerated serving certs
        #[arg(long = "tls-san", value_name = "NAME")]
        tls_san: Vec<String>,
    },
    /// Rotate the certificate authorities; the old trust anchors stay in
    /// the served bundles until cutover
    RotateCa {
        #[arg(long, value_name = "DIR", default_value = "/var/lib/aegis-edge")]
        data_dir: PathBuf,
    },
}

pub fn run(command: CertificateCommand) -> Result<()> {
    match command {
        CertificateCommand::Rotate { data_dir, tls_san } => {
            let secrets = SecretsManager::open(&data_dir)
                .context("is the server still running? certificate rotation needs the data directory lock")?;
            secrets.rotate_leaves(&tls_san)?;
            println!("{}", "leaf certificates rotated; restart the server".green());
        }
        CertificateCommand::RotateCa { data_dir } => {
            let secrets = SecretsManager::open(&data_dir)
                .context("is the server still running? certificate rotation needs the data directory lock")?;
            for kind in CaKind::ALL {
                secrets.rotate_ca(kind)?;
            }
            // Leaves reissued immediately so they chain to the new anchors.
            secrets.rotate_leaves(&[])?;
            println!(
                "{}",
                "certificate authorities rotated; old anchors retained for cutover".green()
            );
        }
    }
    Ok(())
}
