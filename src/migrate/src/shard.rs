// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The two shards a migration talks to.

use std::fmt;

use async_trait::async_trait;
use mysql_async::Value;

use crate::checkpoint::Checkpoint;
use crate::config::MigrationTarget;
use crate::error::MigrateError;
use crate::statement::{ResultSet, Statement};

/// The read-only queries the migrator issues against the source shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceQuery {
    /// The server's current binlog coordinate.
    BinlogPosition,
    /// `SELECT MAX(pk)` over the target's rows.
    MaxKey { target: MigrationTarget },
    /// Up to `limit` of the target's rows with `after < pk <= upto`,
    /// ascending by primary key, with every column.
    Range {
        target: MigrationTarget,
        after: i64,
        upto: i64,
        limit: usize,
    },
}

impl SourceQuery {
    /// Renders the query to SQL and positional parameters.
    ///
    /// [`SourceQuery::BinlogPosition`] has no single rendering; see
    /// [`sm_mysql_util::BINLOG_STATUS_QUERIES`].
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            SourceQuery::BinlogPosition => {
                (sm_mysql_util::BINLOG_STATUS_QUERIES[0].to_string(), vec![])
            }
            SourceQuery::MaxKey { target } => (
                format!(
                    "SELECT MAX({}) FROM {} WHERE {}",
                    target.quoted_primary_key(),
                    target.quoted_table(),
                    tenant_predicate(target),
                ),
                tenant_params(target),
            ),
            SourceQuery::Range {
                target,
                after,
                upto,
                limit,
            } => (
                format!(
                    "SELECT * FROM {table} WHERE {pk} > ? AND {pk} <= ? AND {tenant} ORDER BY {pk} LIMIT ?",
                    table = target.quoted_table(),
                    pk = target.quoted_primary_key(),
                    tenant = tenant_predicate(target),
                ),
                [Value::Int(*after), Value::Int(*upto)]
                    .into_iter()
                    .chain(tenant_params(target))
                    .chain([Value::UInt(u64::try_from(*limit).unwrap_or(u64::MAX))])
                    .collect(),
            ),
        }
    }
}

/// Selects the tenant's rows by the exact bytes of the tenant key, the way
/// the change stream matches row images. The column's collation alone would
/// also match keys differing in case or trailing spaces. The first comparison
/// lets the server use an index on the column.
fn tenant_predicate(target: &MigrationTarget) -> String {
    let column = target.quoted_tenant_column();
    format!("{column} = ? AND CAST({column} AS BINARY) = ?")
}

fn tenant_params(target: &MigrationTarget) -> Vec<Value> {
    let key = Value::from(target.tenant_key.as_str());
    vec![key.clone(), key]
}

impl fmt::Display for SourceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql().0)
    }
}

/// The shard rows are migrated away from.
#[async_trait]
pub trait SourceShard: Send {
    /// Runs `query`, returning column names alongside the rows so that callers
    /// can work with tables of any shape.
    async fn query(&mut self, query: &SourceQuery) -> Result<ResultSet, MigrateError>;
}

/// The shard rows are migrated to.
///
/// Only the migrator's scheduling loop writes to it, so implementations need
/// not guard against concurrent writers.
#[async_trait]
pub trait DestinationShard: Send {
    /// Creates the bookkeeping table checkpoints are stored in, if missing.
    async fn ensure_checkpoint_table(&mut self) -> Result<(), MigrateError>;

    /// Loads the checkpoint previously stored for `target`.
    async fn load_checkpoint(
        &mut self,
        target: &MigrationTarget,
    ) -> Result<Option<Checkpoint>, MigrateError>;

    /// Executes `statements` in order and stores `checkpoint`, all in one
    /// transaction: either every statement and the checkpoint take effect, or
    /// none of them do.
    async fn exec_strict(
        &mut self,
        statements: &[Statement],
        checkpoint: &Checkpoint,
    ) -> Result<(), MigrateError>;
}
