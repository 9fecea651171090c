// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Edge control-plane core
//!
//! Library behind the `aegis-edge` binary: pluggable datastore drivers with
//! an etcd-compatible gRPC bridge, the cluster PKI and secrets manager, the
//! bootstrap coordinator, node registration, and the supervisors for the
//! server and agent roles. The reverse tunnel lives in the sibling
//! `aegis-edge-tunnel` crate.
//!
//! Layering follows the usual split: `domain` holds the data model and
//! ports, `application` the coordinators and role supervisors,
//! `infrastructure` the concrete drivers and file formats, `presentation`
//! the gRPC and HTTPS surfaces.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use application::supervisor::{run_server, ServerContext};
pub use application::agent::run_agent;
pub use domain::config::{AgentConfig, ServerConfig};
