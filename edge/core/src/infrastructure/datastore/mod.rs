// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage driver family. The supervisor picks a backend from the
//! `--datastore-endpoint` string and everything above this module sees only
//! the [`Datastore`] trait.

pub mod postgres;
pub mod raft;
pub mod sql;
pub mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::datastore::{Datastore, DatastoreError};

pub use raft::{RaftOptions, RaftPeer};
pub use sql::{DriverOptions, SqlDriver};

/// Which backend an endpoint string selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    /// Empty endpoint: the embedded single-server SQLite store.
    Embedded,
    /// `postgres://...`: shared external relational store.
    Postgres(String),
    /// `raft://`: embedded Raft-replicated store.
    Raft,
}

pub fn parse_endpoint(endpoint: &str) -> Result<EndpointKind, DatastoreError> {
    if endpoint.is_empty() {
        return Ok(EndpointKind::Embedded);
    }
    if endpoint.starts_with("postgres://") || endpoint.starts_with("postgresql://") {
        return Ok(EndpointKind::Postgres(endpoint.to_string()));
    }
    if endpoint.starts_with("raft://") {
        return Ok(EndpointKind::Raft);
    }
    Err(DatastoreError::Unavailable(format!(
        "unsupported datastore endpoint: {endpoint}"
    )))
}

/// Path of the embedded database under the data directory.
pub fn embedded_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("server").join("db").join("state.db")
}

/// Directory snapshots of the embedded database are kept in.
pub fn snapshot_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("server").join("db").join("snapshots")
}

/// Open the driver selected by `endpoint`.
///
/// `raft` must be provided when the endpoint selects the embedded
/// distributed backend; it is ignored otherwise.
pub async fn open(
    endpoint: &str,
    data_dir: &Path,
    options: DriverOptions,
    raft: Option<RaftOptions>,
) -> Result<Arc<dyn Datastore>, DatastoreError> {
    match parse_endpoint(endpoint)? {
        EndpointKind::Embedded => {
            let backend = sqlite::SqliteBackend::open(&embedded_db_path(data_dir)).await?;
            let driver = SqlDriver::open(backend, options).await?;
            Ok(driver as Arc<dyn Datastore>)
        }
        EndpointKind::Postgres(dsn) => {
            let backend = postgres::PostgresBackend::connect(&dsn).await?;
            let driver = SqlDriver::open(backend, options).await?;
            Ok(driver as Arc<dyn Datastore>)
        }
        EndpointKind::Raft => {
            let raft = raft.ok_or_else(|| {
                DatastoreError::Unavailable("raft endpoint requires replication options".to_string())
            })?;
            let backend = raft::RaftBackend::start(data_dir, raft).await?;
            let driver = SqlDriver::open(backend, options).await?;
            Ok(driver as Arc<dyn Datastore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("").unwrap(), EndpointKind::Embedded);
        assert!(matches!(
            parse_endpoint("postgres://user@db/kv").unwrap(),
            EndpointKind::Postgres(_)
        ));
        assert_eq!(parse_endpoint("raft://").unwrap(), EndpointKind::Raft);
        assert!(parse_endpoint("mysql://nope").is_err());
    }
}
