// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-edge agent` - join this node to a cluster and keep it joined.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use aegis_edge_core::AgentConfig;

#[derive(Args)]
pub struct AgentArgs {
    /// URL of any control-plane server, e.g. https://10.0.0.1:6443
    #[arg(long, value_name = "URL", env = "AEGIS_EDGE_URL")]
    server: String,

    /// Cluster join token
    #[arg(long, env = "AEGIS_EDGE_TOKEN")]
    token: String,

    /// Data directory
    #[arg(long, value_name = "DIR", default_value = "/var/lib/aegis-edge")]
    data_dir: PathBuf,

    /// Node name (defaults to the hostname)
    #[arg(long)]
    node_name: Option<String>,

    /// Loopback port the local components use as their API address
    #[arg(long, value_name = "PORT", default_value = "6444")]
    lb_port: u16,

    /// Container runtime socket override
    #[arg(long, value_name = "PATH")]
    runtime_socket: Option<String>,
}

pub async fn run(args: AgentArgs) -> Result<()> {
    let config = AgentConfig {
        server_url: args.server,
        token: args.token,
        data_dir: args.data_dir,
        node_name: args.node_name,
        lb_port: args.lb_port,
        runtime_socket: args.runtime_socket,
    };
    let cancel = super::shutdown_token();
    aegis_edge_core::run_agent(config, cancel).await
}
