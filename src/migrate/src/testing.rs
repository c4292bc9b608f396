// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory shards and change streams for tests.
//!
//! Handles are cheap to clone and clones share state, so a test can keep one
//! to inspect or mutate a shard while the migrator owns another.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use mysql_async::Value;
use tokio::sync::mpsc;

use crate::checkpoint::Checkpoint;
use crate::config::MigrationTarget;
use crate::error::MigrateError;
use crate::shard::{DestinationShard, SourceQuery, SourceShard};
use crate::statement::{ResultSet, Statement, value_matches_key, value_to_key};
use crate::stream::{ChangeStream, ReplicationPosition, WriteBatch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct SourceInner {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    binlog_status: ResultSet,
    max_key_override: Option<ResultSet>,
    fail_next: Option<String>,
    log: Vec<SourceQuery>,
}

/// A source shard holding a single table.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<SourceInner>>,
}

impl MemorySource {
    pub fn new(columns: Vec<String>) -> Self {
        let binlog_status = ResultSet {
            columns: vec!["File".into(), "Position".into()],
            rows: vec![vec![Value::from("mysql-bin.000001"), Value::from("4")]],
        };
        MemorySource {
            inner: Arc::new(Mutex::new(SourceInner {
                columns,
                rows: Vec::new(),
                binlog_status,
                max_key_override: None,
                fail_next: None,
                log: Vec::new(),
            })),
        }
    }

    pub fn insert(&self, row: Vec<Value>) {
        let mut inner = lock(&self.inner);
        assert_eq!(row.len(), inner.columns.len(), "row does not match columns");
        inner.rows.push(row);
    }

    pub fn set_binlog_status(&self, status: ResultSet) {
        lock(&self.inner).binlog_status = status;
    }

    /// Answers `MAX(pk)` queries with `result` instead of computing them.
    pub fn override_max_key(&self, result: ResultSet) {
        lock(&self.inner).max_key_override = Some(result);
    }

    pub fn fail_next_query(&self, message: &str) {
        lock(&self.inner).fail_next = Some(message.to_string());
    }

    /// Every query answered so far, oldest first.
    pub fn queries(&self) -> Vec<SourceQuery> {
        lock(&self.inner).log.clone()
    }

    fn scoped_rows(
        inner: &SourceInner,
        target: &MigrationTarget,
    ) -> Result<Vec<(i64, Vec<Value>)>, MigrateError> {
        let position = |name: &str| {
            inner
                .columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| anyhow!("Unknown column '{name}'"))
        };
        let key = position(&target.primary_key_column)?;
        let tenant = position(&target.tenant_column)?;
        let mut rows = Vec::new();
        for row in &inner.rows {
            if value_matches_key(&row[tenant], &target.tenant_key) {
                rows.push((value_to_key(&row[key])?, row.clone()));
            }
        }
        rows.sort_by_key(|(key, _)| *key);
        Ok(rows)
    }
}

#[async_trait]
impl SourceShard for MemorySource {
    async fn query(&mut self, query: &SourceQuery) -> Result<ResultSet, MigrateError> {
        let mut inner = lock(&self.inner);
        inner.log.push(query.clone());
        if let Some(message) = inner.fail_next.take() {
            return Err(MigrateError::Generic(anyhow!(message)));
        }
        match query {
            SourceQuery::BinlogPosition => Ok(inner.binlog_status.clone()),
            SourceQuery::MaxKey { target } => {
                if let Some(result) = &inner.max_key_override {
                    return Ok(result.clone());
                }
                let max = Self::scoped_rows(&inner, target)?
                    .last()
                    .map_or(Value::NULL, |(key, _)| Value::Int(*key));
                Ok(ResultSet {
                    columns: vec![format!("MAX({})", target.primary_key_column)],
                    rows: vec![vec![max]],
                })
            }
            SourceQuery::Range {
                target,
                after,
                upto,
                limit,
            } => {
                let rows = Self::scoped_rows(&inner, target)?
                    .into_iter()
                    .filter(|(key, _)| after < key && key <= upto)
                    .take(*limit)
                    .map(|(_, row)| row)
                    .collect();
                Ok(ResultSet {
                    columns: inner.columns.clone(),
                    rows,
                })
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
struct DestinationData {
    tables: BTreeMap<String, (Vec<String>, BTreeMap<i64, Vec<Value>>)>,
    checkpoints: BTreeMap<(String, String), Checkpoint>,
}

#[derive(Debug, Default)]
struct DestinationInner {
    data: DestinationData,
    checkpoint_table: bool,
    fail_next: Option<String>,
    log: Vec<Statement>,
    writes: usize,
}

/// A destination shard with `REPLACE`/`DELETE` semantics keyed on a single
/// integer column.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    key_column: String,
    inner: Arc<Mutex<DestinationInner>>,
}

impl MemoryDestination {
    pub fn new(key_column: &str) -> Self {
        MemoryDestination {
            key_column: key_column.to_string(),
            inner: Arc::new(Mutex::new(DestinationInner::default())),
        }
    }

    /// Makes the next `exec_strict` fail without applying anything.
    pub fn fail_next_write(&self, message: &str) {
        lock(&self.inner).fail_next = Some(message.to_string());
    }

    pub fn row_keys(&self, table: &str) -> Vec<i64> {
        lock(&self.inner)
            .data
            .tables
            .get(table)
            .map(|(_, rows)| rows.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        lock(&self.inner)
            .data
            .tables
            .get(table)
            .map(|(_, rows)| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: i64) -> Option<Vec<Value>> {
        lock(&self.inner)
            .data
            .tables
            .get(table)
            .and_then(|(_, rows)| rows.get(&key).cloned())
    }

    pub fn checkpoint(&self, target: &MigrationTarget) -> Option<Checkpoint> {
        lock(&self.inner)
            .data
            .checkpoints
            .get(&(target.table.clone(), target.tenant_key.clone()))
            .cloned()
    }

    /// Stores `checkpoint` as if a previous run had written it.
    pub fn put_checkpoint(&self, checkpoint: Checkpoint) {
        lock(&self.inner).data.checkpoints.insert(
            (checkpoint.table.clone(), checkpoint.tenant_key.clone()),
            checkpoint,
        );
    }

    pub fn has_checkpoint_table(&self) -> bool {
        lock(&self.inner).checkpoint_table
    }

    /// Every statement committed so far, in commit order.
    pub fn statements(&self) -> Vec<Statement> {
        lock(&self.inner).log.clone()
    }

    /// Number of committed `exec_strict` calls.
    pub fn write_count(&self) -> usize {
        lock(&self.inner).writes
    }

    fn apply(
        key_column: &str,
        data: &mut DestinationData,
        statement: &Statement,
    ) -> Result<(), MigrateError> {
        match statement {
            Statement::Replace {
                table,
                columns,
                rows,
            } => {
                let key = columns
                    .iter()
                    .position(|c| c == key_column)
                    .ok_or_else(|| {
                        MigrateError::Destination(format!("no key column in {columns:?}"))
                    })?;
                let (known, stored) = data
                    .tables
                    .entry(table.clone())
                    .or_insert_with(|| (columns.clone(), BTreeMap::new()));
                if known != columns {
                    return Err(MigrateError::Destination(format!(
                        "column mismatch: {known:?} vs {columns:?}"
                    )));
                }
                for row in rows {
                    stored.insert(value_to_key(&row[key])?, row.clone());
                }
            }
            Statement::Delete {
                table,
                key_column: _,
                key,
            } => {
                let key = value_to_key(key)?;
                if let Some((_, stored)) = data.tables.get_mut(table) {
                    stored.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationShard for MemoryDestination {
    async fn ensure_checkpoint_table(&mut self) -> Result<(), MigrateError> {
        lock(&self.inner).checkpoint_table = true;
        Ok(())
    }

    async fn load_checkpoint(
        &mut self,
        target: &MigrationTarget,
    ) -> Result<Option<Checkpoint>, MigrateError> {
        Ok(self.checkpoint(target))
    }

    async fn exec_strict(
        &mut self,
        statements: &[Statement],
        checkpoint: &Checkpoint,
    ) -> Result<(), MigrateError> {
        let mut inner = lock(&self.inner);
        if let Some(message) = inner.fail_next.take() {
            return Err(MigrateError::Destination(message));
        }
        // Stage everything on a copy so a failing statement leaves no trace.
        let mut staged = inner.data.clone();
        for statement in statements {
            Self::apply(&self.key_column, &mut staged, statement)?;
        }
        staged.checkpoints.insert(
            (checkpoint.table.clone(), checkpoint.tenant_key.clone()),
            checkpoint.clone(),
        );
        inner.data = staged;
        inner.log.extend(statements.iter().cloned());
        inner.writes += 1;
        Ok(())
    }
}

#[derive(Debug)]
enum Scripted {
    Batch(WriteBatch),
    Fail(String),
}

/// A change stream fed by the test through a [`ManualStreamHandle`].
#[derive(Debug)]
pub struct ManualStream {
    commands: mpsc::UnboundedReceiver<Scripted>,
    started_at: Arc<Mutex<Option<ReplicationPosition>>>,
}

/// Test side of a [`ManualStream`].
#[derive(Debug, Clone)]
pub struct ManualStreamHandle {
    commands: mpsc::UnboundedSender<Scripted>,
    started_at: Arc<Mutex<Option<ReplicationPosition>>>,
}

impl ManualStream {
    pub fn new() -> (ManualStream, ManualStreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let started_at = Arc::new(Mutex::new(None));
        (
            ManualStream {
                commands: rx,
                started_at: Arc::clone(&started_at),
            },
            ManualStreamHandle {
                commands: tx,
                started_at,
            },
        )
    }
}

impl ManualStreamHandle {
    /// Queues `batch` for publication. Returns false once the stream is gone.
    pub fn send(&self, batch: WriteBatch) -> bool {
        self.commands.send(Scripted::Batch(batch)).is_ok()
    }

    /// Makes the stream exit with an error after publishing what was queued.
    pub fn fail(&self, message: &str) {
        let _ = self.commands.send(Scripted::Fail(message.to_string()));
    }

    /// The position the migrator started the stream from, once it has.
    pub fn started_at(&self) -> Option<ReplicationPosition> {
        lock(&self.started_at).clone()
    }
}

#[async_trait]
impl ChangeStream for ManualStream {
    async fn run(
        mut self,
        start: ReplicationPosition,
        batches: mpsc::Sender<WriteBatch>,
    ) -> Result<(), MigrateError> {
        *lock(&self.started_at) = Some(start);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Scripted::Batch(batch)) => {
                        if batches.send(batch).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Scripted::Fail(message)) => return Err(MigrateError::Stream(message)),
                    // The test dropped its handle; keep the stream open like a
                    // quiet binlog would.
                    None => {
                        batches.closed().await;
                        return Ok(());
                    }
                },
                _ = batches.closed() => return Ok(()),
            }
        }
    }
}

/// A single-row `REPLACE` batch, handy for driving the change path.
pub fn replace_batch(
    target: &MigrationTarget,
    columns: &[&str],
    row: Vec<Value>,
    position: ReplicationPosition,
) -> WriteBatch {
    WriteBatch::new(
        vec![Statement::Replace {
            table: target.table.clone(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: vec![row],
        }],
        position,
    )
}

/// A single-row `DELETE` batch.
pub fn delete_batch(target: &MigrationTarget, key: i64, position: ReplicationPosition) -> WriteBatch {
    WriteBatch::new(
        vec![Statement::Delete {
            table: target.table.clone(),
            key_column: target.primary_key_column.clone(),
            key: Value::Int(key),
        }],
        position,
    )
}
