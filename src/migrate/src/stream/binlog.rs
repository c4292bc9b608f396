// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A [`ChangeStream`] reading the source shard's binlog.
//!
//! The reader registers as a replica with a file/offset coordinate, decodes
//! row events for the migrated table, and publishes one [`WriteBatch`] per
//! committed transaction that touched the tenant. The coordinate attached to
//! a batch is the end of its commit event, so restarting from it resumes with
//! the next transaction.
//!
//! Transactions of other tenants produce no batch. The coordinate past them is
//! still published, as a batch without statements, at most once per progress
//! interval, so the stored position keeps up with the binlog while the tenant
//! is quiet.

use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::EventData;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn};
use sm_mysql_util::{ER_SOURCE_FATAL_ERROR_READING_BINLOG_CODE, ensure_full_row_binlog_format};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::config::{DEFAULT_IDLE_INTERVAL, MigrationTarget};
use crate::error::MigrateError;
use crate::stream::cursor::{BinlogCursor, EventKind};
use crate::stream::translate::{RowChange, TableLayout, TransactionBuffer, Translator};
use crate::stream::{ChangeStream, ReplicationPosition, WriteBatch};

/// Replica id we register under unless told otherwise.
pub const DEFAULT_SERVER_ID: u32 = 1;

/// How often the server sends a heartbeat over an otherwise idle stream.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct MySqlChangeStream {
    config: sm_mysql_util::Config,
    target: MigrationTarget,
    server_id: u32,
    progress_interval: Duration,
}

impl MySqlChangeStream {
    pub fn new(config: sm_mysql_util::Config, target: MigrationTarget) -> Self {
        MySqlChangeStream {
            config,
            target,
            server_id: DEFAULT_SERVER_ID,
            progress_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    /// Sets the replica id. It must differ from every other replica of the
    /// source server, or the server drops one of the two connections.
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Sets how often the position past skipped transactions is published.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(Duration::from_millis(1));
        self
    }

    async fn load_layout(&self, conn: &mut Conn, database: &str) -> Result<TableLayout, MigrateError> {
        let columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, self.target.table.as_str()),
            )
            .await?;
        if columns.is_empty() {
            return Err(MigrateError::Setup(format!(
                "table {}.{} not found on source",
                database, self.target.table
            )));
        }
        TableLayout::new(&self.target, columns)
    }

    async fn open(
        &self,
        mut conn: Conn,
        start: &ReplicationPosition,
    ) -> Result<BinlogStream, MigrateError> {
        conn.query_drop(format!(
            "SET @master_heartbeat_period = {};",
            HEARTBEAT_PERIOD.as_nanos()
        ))
        .await?;

        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(start.file.as_bytes())
            .with_pos(start.offset);
        match conn.get_binlog_stream(request).await {
            Ok(stream) => Ok(stream),
            Err(mysql_async::Error::Server(ref server_err))
                if server_err.code == ER_SOURCE_FATAL_ERROR_READING_BINLOG_CODE =>
            {
                // The file was purged; nothing short of a new migration helps.
                Err(MigrateError::Setup(format!(
                    "binlog position {start} is not available: {}",
                    server_err.message
                )))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ChangeStream for MySqlChangeStream {
    async fn run(
        self,
        start: ReplicationPosition,
        batches: mpsc::Sender<WriteBatch>,
    ) -> Result<(), MigrateError> {
        let database = self
            .config
            .db_name()
            .ok_or_else(|| MigrateError::Setup("source url must name a database".into()))?
            .to_string();

        let mut conn = self.config.connect("binlog reader").await?;
        ensure_full_row_binlog_format(&mut conn).await?;
        let translator = Translator::new(
            self.target.clone(),
            self.load_layout(&mut conn, &database).await?,
        );

        let binlog_stream = self.open(conn, &start).await?;
        let mut stream = pin!(binlog_stream);
        let mut cursor = BinlogCursor::new(&start, &database, &self.target.table);
        let mut txn = TransactionBuffer::default();
        let mut progress = tokio::time::interval_at(
            Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(migration = %self.target, %start, server_id = self.server_id, "reading binlog");
        loop {
            let event = tokio::select! {
                biased;
                _ = batches.closed() => {
                    debug!(migration = %self.target, "batch receiver dropped, stopping binlog reader");
                    return Ok(());
                }
                _ = progress.tick() => {
                    if let Some(batch) = txn.take_progress() {
                        trace!(migration = %self.target, position = %batch.position, "publishing position");
                        if batches.send(batch).await.is_err() {
                            return Ok(());
                        }
                    }
                    continue;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else {
                // We never expect the replication stream to gracefully end.
                return Err(MigrateError::Stream("binlog stream ended".into()));
            };
            let event = event?;
            let end = u64::from(event.header().log_pos());

            let kind = match event.read_data()? {
                Some(EventData::RotateEvent(rotate)) => EventKind::Rotate {
                    file: rotate.name().into_owned(),
                },
                Some(EventData::RowsEvent(data)) => {
                    let table_map_event = stream.get_tme(data.table_id()).ok_or_else(|| {
                        MigrateError::Stream(format!(
                            "table map event for table id {} not found",
                            data.table_id()
                        ))
                    })?;
                    if cursor.wants_rows(
                        &*table_map_event.database_name(),
                        &*table_map_event.table_name(),
                    ) {
                        let mut rows_iter = data.rows(table_map_event);
                        while let Some(images) = rows_iter.next() {
                            let (before, after) = images?;
                            let before = before.map(mysql_async::Row::try_from).transpose()?;
                            let after = after.map(mysql_async::Row::try_from).transpose()?;
                            let change = RowChange::from_images(
                                before.map(mysql_async::Row::unwrap),
                                after.map(mysql_async::Row::unwrap),
                            );
                            if let Some(change) = change {
                                for statement in translator.translate(change)? {
                                    txn.push(statement);
                                }
                            }
                        }
                    }
                    EventKind::Rows
                }
                Some(EventData::XidEvent(_)) => EventKind::Xid,
                Some(EventData::QueryEvent(query)) => EventKind::Query(query.query().into_owned()),
                _ => EventKind::Other,
            };
            let rotated = matches!(kind, EventKind::Rotate { .. });
            let committed = cursor.advance(kind, end);
            if rotated {
                trace!(file = cursor.file(), "binlog rotated");
            }
            let Some(position) = committed else {
                continue;
            };
            if let Some(batch) = txn.commit(position) {
                trace!(
                    migration = %self.target,
                    position = %batch.position,
                    statements = batch.statements.len(),
                    "publishing transaction"
                );
                if batches.send(batch).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
