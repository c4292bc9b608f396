// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shards backed by MySQL connections.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row, TxOpts, Value};
use sm_mysql_util::{BINLOG_STATUS_QUERIES, Config, ER_PARSE_ERROR, quote_identifier};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, MigrationState};
use crate::config::{DEFAULT_CHECKPOINT_TABLE, MigrationTarget};
use crate::error::MigrateError;
use crate::shard::{DestinationShard, SourceQuery, SourceShard};
use crate::statement::{ResultSet, Statement};
use crate::stream::ReplicationPosition;

fn into_result_set(rows: Vec<Row>) -> ResultSet {
    // Column names come with every row; an empty result needs none.
    let columns = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|column| column.name_str().into_owned())
                .collect()
        })
        .unwrap_or_default();
    ResultSet {
        columns,
        rows: rows.into_iter().map(Row::unwrap).collect(),
    }
}

#[derive(Debug)]
pub struct MySqlSource {
    conn: Conn,
}

impl MySqlSource {
    pub fn new(conn: Conn) -> Self {
        MySqlSource { conn }
    }

    pub async fn connect(config: &Config) -> Result<Self, MigrateError> {
        Ok(MySqlSource::new(config.connect("source shard").await?))
    }

    /// Runs the first binlog status statement the server understands. MySQL
    /// 8.4 removed `SHOW MASTER STATUS` in favor of `SHOW BINARY LOG STATUS`,
    /// which older servers reject as a syntax error.
    async fn binlog_status(&mut self) -> Result<ResultSet, MigrateError> {
        let mut last_err = None;
        for query in BINLOG_STATUS_QUERIES {
            match self.conn.query::<Row, _>(query).await {
                Ok(rows) => return Ok(into_result_set(rows)),
                Err(mysql_async::Error::Server(err)) if err.code == ER_PARSE_ERROR => {
                    debug!(query, "binlog status statement not supported, trying next");
                    last_err = Some(mysql_async::Error::Server(err));
                }
                Err(err) => return Err(err.into()),
            }
        }
        match last_err {
            Some(err) => Err(err.into()),
            None => Err(MigrateError::Setup("no binlog status statement configured".into())),
        }
    }
}

#[async_trait]
impl SourceShard for MySqlSource {
    async fn query(&mut self, query: &SourceQuery) -> Result<ResultSet, MigrateError> {
        if let SourceQuery::BinlogPosition = query {
            return self.binlog_status().await;
        }
        let (sql, params) = query.to_sql();
        let rows: Vec<Row> = self.conn.exec(sql, params).await?;
        Ok(into_result_set(rows))
    }
}

/// The destination shard. Checkpoints live in a bookkeeping table next to the
/// migrated data so they commit atomically with it.
#[derive(Debug)]
pub struct MySqlDestination {
    conn: Conn,
    checkpoint_table: String,
}

impl MySqlDestination {
    pub fn new(conn: Conn) -> Self {
        MySqlDestination {
            conn,
            checkpoint_table: DEFAULT_CHECKPOINT_TABLE.to_string(),
        }
    }

    pub async fn connect(config: &Config) -> Result<Self, MigrateError> {
        Ok(MySqlDestination::new(config.connect("destination shard").await?))
    }

    pub fn with_checkpoint_table(mut self, table: impl Into<String>) -> Self {
        self.checkpoint_table = table.into();
        self
    }

    fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> (String, Vec<Value>) {
        let sql = format!(
            "INSERT INTO {} \
             (table_name, tenant_key, cursor_key, bound_key, migrated, binlog_file, binlog_offset) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
             cursor_key = VALUES(cursor_key), bound_key = VALUES(bound_key), \
             migrated = VALUES(migrated), binlog_file = VALUES(binlog_file), \
             binlog_offset = VALUES(binlog_offset)",
            quote_identifier(&self.checkpoint_table)
        );
        let state = &checkpoint.state;
        let params = vec![
            Value::from(checkpoint.table.as_str()),
            Value::from(checkpoint.tenant_key.as_str()),
            Value::Int(state.cursor),
            Value::Int(state.bound),
            Value::from(state.migrated),
            Value::from(state.position.file.as_str()),
            Value::UInt(state.position.offset),
        ];
        (sql, params)
    }
}

#[async_trait]
impl DestinationShard for MySqlDestination {
    async fn ensure_checkpoint_table(&mut self) -> Result<(), MigrateError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                table_name VARCHAR(64) NOT NULL,
                tenant_key VARCHAR(255) NOT NULL,
                cursor_key BIGINT NOT NULL,
                bound_key BIGINT NOT NULL,
                migrated BOOLEAN NOT NULL,
                binlog_file VARCHAR(512) NOT NULL,
                binlog_offset BIGINT UNSIGNED NOT NULL,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                PRIMARY KEY (table_name, tenant_key)
            )",
            quote_identifier(&self.checkpoint_table)
        );
        self.conn.query_drop(ddl).await?;
        info!(table = %self.checkpoint_table, "checkpoint table ready");
        Ok(())
    }

    async fn load_checkpoint(
        &mut self,
        target: &MigrationTarget,
    ) -> Result<Option<Checkpoint>, MigrateError> {
        let sql = format!(
            "SELECT cursor_key, bound_key, migrated, binlog_file, binlog_offset \
             FROM {} WHERE table_name = ? AND tenant_key = ?",
            quote_identifier(&self.checkpoint_table)
        );
        let row: Option<(i64, i64, bool, String, u64)> = self
            .conn
            .exec_first(sql, (target.table.as_str(), target.tenant_key.as_str()))
            .await?;
        let Some((cursor, bound, migrated, file, offset)) = row else {
            return Ok(None);
        };
        if file.is_empty() {
            return Err(MigrateError::InvalidCheckpoint(format!(
                "checkpoint of {target} has no binlog file"
            )));
        }
        Ok(Some(Checkpoint::new(
            target,
            MigrationState {
                cursor,
                bound,
                migrated,
                position: ReplicationPosition::new(file, offset),
            },
        )))
    }

    async fn exec_strict(
        &mut self,
        statements: &[Statement],
        checkpoint: &Checkpoint,
    ) -> Result<(), MigrateError> {
        let (checkpoint_sql, checkpoint_params) = self.upsert_checkpoint(checkpoint);
        // Dropping the transaction without committing rolls it back.
        let mut tx = self.conn.start_transaction(TxOpts::default()).await?;
        for statement in statements.iter().filter(|s| !s.is_noop()) {
            let (sql, params) = statement.to_sql();
            tx.exec_drop(sql, params).await?;
        }
        tx.exec_drop(checkpoint_sql, checkpoint_params).await?;
        tx.commit().await?;
        Ok(())
    }
}
