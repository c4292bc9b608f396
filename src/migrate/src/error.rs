// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors raised while migrating a tenant.
//!
//! Errors fall in two classes. Setup and query-shape errors mean the
//! migration is misconfigured or the schema drifted; restarting will hit them
//! again. Everything else is considered transient: the destination write that
//! failed left no trace (the checkpoint did not move), so a supervisor may
//! restart the migrator and it will resume where it stopped.

use std::io;

use sm_mysql_util::MySqlError;

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The migration could not be set up, e.g. the replication endpoint
    /// refused us or the server is not configured for row-based binlogs.
    #[error("setup failed: {0}")]
    Setup(String),
    /// A query returned a result of an unexpected shape.
    #[error("query '{query}' returned {detail}")]
    QueryShape { query: String, detail: String },
    /// A primary key value could not be interpreted as an integer.
    #[error("cannot convert {value} to an integer key")]
    InvalidKey { value: String },
    #[error("column '{0}' missing from result set")]
    MissingColumn(String),
    #[error("stored checkpoint is invalid: {0}")]
    InvalidCheckpoint(String),
    #[error("destination write failed: {0}")]
    Destination(String),
    #[error("change stream failed: {0}")]
    Stream(String),
    /// The change stream task exited without reporting an error.
    #[error("change stream closed")]
    StreamClosed,
    #[error("couldn't decode binlog row")]
    BinlogRowDecode(#[from] mysql_async::binlog::row::BinlogRowToRowError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("sql client error: {0}")]
    MySqlClient(#[from] mysql_async::Error),
    #[error(transparent)]
    MySql(#[from] MySqlError),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl MigrateError {
    /// Whether restarting the migrator may get past this error.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Setup(_)
            | MigrateError::QueryShape { .. }
            | MigrateError::InvalidKey { .. }
            | MigrateError::MissingColumn(_)
            | MigrateError::InvalidCheckpoint(_) => false,
            MigrateError::MySql(err) => !matches!(
                err,
                MySqlError::InvalidClientConfig(_)
                    | MySqlError::InvalidSystemSetting { .. }
                    | MySqlError::InvalidBinlogPosition(_)
            ),
            MigrateError::Destination(_)
            | MigrateError::Stream(_)
            | MigrateError::StreamClosed
            | MigrateError::BinlogRowDecode(_)
            | MigrateError::Io(_)
            | MigrateError::MySqlClient(_)
            | MigrateError::Generic(_) => true,
        }
    }
}
