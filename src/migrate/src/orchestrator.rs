// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The migrator: drives one tenant's migration to convergence, then keeps the
//! destination current until told to stop.
//!
//! Two activities run concurrently. A background task runs the
//! [`ChangeStream`], publishing committed source transactions into a bounded
//! channel. The foreground loop is the only writer to the destination: each
//! step it applies one pending change batch if there is one, and otherwise
//! copies one backfill batch. Once the backfill is complete the loop waits for
//! change batches, waking up at least every idle interval.
//!
//! Every write commits together with the updated checkpoint, so a migrator
//! restarted after a crash resumes with the backfill cursor and the stream
//! position of the last successful write.
//!
//! Backfill and change-stream writes may interleave in either order. A backfill
//! batch can overwrite a key with a version older than a change batch applied
//! just before it. The stream started at a position no later than any backfill
//! read, so the change that produced the newer version is either still queued
//! or was read by the backfill itself, and the key converges once the queue is
//! drained.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace};

use crate::backfill::{BackfillCopier, CopyOutcome};
use crate::bound::resolve_bound;
use crate::checkpoint::{Checkpoint, MigrationState};
use crate::config::{MigrationConfig, MigrationTarget};
use crate::error::MigrateError;
use crate::metrics::Metrics;
use crate::position::resolve_position;
use crate::shard::{DestinationShard, SourceShard};
use crate::stream::{ChangeStream, WriteBatch};

/// What one scheduling step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A change batch with this many statements was applied.
    AppliedBatch { statements: usize },
    /// A backfill step ran.
    Copied(CopyOutcome),
    /// The backfill is complete and no change batch is pending.
    Idle,
}

#[derive(Debug)]
pub struct Migrator<S, D> {
    target: MigrationTarget,
    config: MigrationConfig,
    source: S,
    destination: D,
    copier: BackfillCopier,
    state: MigrationState,
    metrics: Metrics,
}

impl<S, D> Migrator<S, D>
where
    S: SourceShard,
    D: DestinationShard,
{
    /// Loads the checkpoint of `target` from the destination, or starts a new
    /// migration if there is none.
    ///
    /// A new migration resolves the replication position before the snapshot
    /// bound. Any change committed after the bound was read is then guaranteed
    /// to be in the change stream. The initial state is stored before the
    /// first backfill read.
    pub async fn prepare(
        target: MigrationTarget,
        config: MigrationConfig,
        mut source: S,
        mut destination: D,
        metrics: Metrics,
    ) -> Result<Self, MigrateError> {
        destination.ensure_checkpoint_table().await?;

        let state = match destination.load_checkpoint(&target).await? {
            Some(checkpoint) => {
                if !checkpoint.belongs_to(&target) {
                    return Err(MigrateError::InvalidCheckpoint(format!(
                        "loaded checkpoint of {}[{}] for {target}",
                        checkpoint.table, checkpoint.tenant_key
                    )));
                }
                let state = MigrationState::restore(checkpoint);
                info!(
                    migration = %target,
                    cursor = state.cursor,
                    bound = state.bound,
                    migrated = state.migrated,
                    position = %state.position,
                    remaining_keys = state.remaining_keys(),
                    "resuming migration from checkpoint"
                );
                state
            }
            None => {
                let position = resolve_position(&mut source).await?;
                let bound = resolve_bound(&mut source, &target).await?;
                let state = MigrationState::new(position, bound);
                destination
                    .exec_strict(&[], &Checkpoint::new(&target, state.clone()))
                    .await?;
                info!(
                    migration = %target,
                    bound,
                    position = %state.position,
                    "starting new migration"
                );
                state
            }
        };
        metrics.observe_state(&state);

        Ok(Migrator {
            copier: BackfillCopier::new(target.clone(), config.batch_size),
            target,
            config,
            source,
            destination,
            state,
            metrics,
        })
    }

    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    /// Applies `batch` and moves the stored stream position past it. A batch
    /// without statements only stores the position.
    pub async fn apply_batch(&mut self, batch: WriteBatch) -> Result<(), MigrateError> {
        let mut next = self.state.clone();
        next.position = batch.position;
        self.destination
            .exec_strict(&batch.statements, &Checkpoint::new(&self.target, next.clone()))
            .await?;
        self.state = next;

        let statements = batch.statements.len();
        if statements == 0 {
            trace!(migration = %self.target, position = %self.state.position, "advanced stream position");
            return Ok(());
        }
        self.metrics.batches_applied.inc();
        self.metrics
            .statements_applied
            .inc_by(u64::try_from(statements).unwrap_or(u64::MAX));
        debug!(
            migration = %self.target,
            statements,
            position = %self.state.position,
            "applied change batch"
        );
        Ok(())
    }

    /// Runs one backfill step.
    pub async fn copy_next_batch(&mut self) -> Result<CopyOutcome, MigrateError> {
        let was_migrated = self.state.migrated;
        let outcome = self
            .copier
            .copy_next_batch(&mut self.source, &mut self.destination, &mut self.state)
            .await?;
        if outcome.rows > 0 {
            self.metrics.backfill_batches.inc();
            self.metrics
                .rows_copied
                .inc_by(u64::try_from(outcome.rows).unwrap_or(u64::MAX));
        }
        self.metrics.observe_state(&self.state);
        if outcome.converged && !was_migrated {
            info!(
                migration = %self.target,
                bound = self.state.bound,
                "backfill complete"
            );
        }
        Ok(outcome)
    }

    /// Runs one scheduling step. A pending change batch always goes before
    /// backfill work; checking for one never blocks.
    pub async fn tick(
        &mut self,
        batches: &mut mpsc::Receiver<WriteBatch>,
    ) -> Result<Tick, MigrateError> {
        match batches.try_recv() {
            Ok(batch) => {
                let statements = batch.statements.len();
                self.apply_batch(batch).await?;
                return Ok(Tick::AppliedBatch { statements });
            }
            Err(TryRecvError::Disconnected) => return Err(MigrateError::StreamClosed),
            Err(TryRecvError::Empty) => {}
        }
        if self.state.migrated {
            return Ok(Tick::Idle);
        }
        Ok(Tick::Copied(self.copy_next_batch().await?))
    }

    /// Starts `stream` at the stored position and schedules until `shutdown`
    /// is cancelled or an error occurs.
    ///
    /// Cancellation is only observed between writes. On return the stream task
    /// is aborted.
    pub async fn run<C>(mut self, stream: C, shutdown: CancellationToken) -> Result<(), MigrateError>
    where
        C: ChangeStream,
    {
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let start = self.state.position.clone();
        info!(migration = %self.target, %start, "starting change stream");
        let stream_task = AbortOnDropHandle::new(tokio::spawn(stream.run(start, tx)));

        loop {
            if shutdown.is_cancelled() {
                info!(migration = %self.target, "migration stopped");
                return Ok(());
            }
            match self.tick(&mut rx).await {
                Ok(Tick::Idle) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {}
                        batch = rx.recv() => match batch {
                            Some(batch) => self.apply_batch(batch).await?,
                            None => return Err(stream_exit(stream_task).await),
                        },
                        _ = tokio::time::sleep(self.config.idle_interval) => {}
                    }
                }
                Ok(Tick::AppliedBatch { .. } | Tick::Copied(_)) => {}
                Err(MigrateError::StreamClosed) => return Err(stream_exit(stream_task).await),
                Err(err) => return Err(err),
            }
        }
    }
}

/// The error explaining why the change stream task ended.
async fn stream_exit(task: AbortOnDropHandle<Result<(), MigrateError>>) -> MigrateError {
    match task.await {
        Ok(Ok(())) => MigrateError::StreamClosed,
        Ok(Err(err)) => err,
        Err(join_err) => MigrateError::Stream(format!("change stream task failed: {join_err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mysql_async::Value;
    use prometheus::Registry;

    use super::*;
    use crate::checkpoint::CURSOR_START;
    use crate::shard::SourceQuery;
    use crate::statement::Statement;
    use crate::stream::ReplicationPosition;
    use crate::testing::{
        ManualStream, MemoryDestination, MemorySource, delete_batch, replace_batch,
    };

    const COLUMNS: [&str; 3] = ["id", "tenant_id", "body"];

    fn target() -> MigrationTarget {
        MigrationTarget::new("t1")
    }

    fn row(id: i64, tenant: &str, body: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::from(tenant), Value::from(body)]
    }

    fn source(ids: std::ops::RangeInclusive<i64>) -> MemorySource {
        let source = MemorySource::new(COLUMNS.iter().map(|c| c.to_string()).collect());
        for id in ids {
            source.insert(row(id, "t1", "v1"));
        }
        source
    }

    fn pos(offset: u64) -> ReplicationPosition {
        ReplicationPosition::new("mysql-bin.000001", offset)
    }

    async fn prepared(
        source: &MemorySource,
        destination: &MemoryDestination,
    ) -> Migrator<MemorySource, MemoryDestination> {
        Migrator::prepare(
            target(),
            MigrationConfig::default(),
            source.clone(),
            destination.clone(),
            Metrics::register_into(&Registry::new(), &target()).unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn new_migration_resolves_position_then_bound() {
        let source = source(1..=2500);
        let destination = MemoryDestination::new("id");
        let migrator = prepared(&source, &destination).await;

        assert_eq!(
            source.queries(),
            vec![SourceQuery::BinlogPosition, SourceQuery::MaxKey { target: target() }]
        );
        let expected = MigrationState::new(pos(4), 2500);
        assert_eq!(migrator.state(), &expected);
        assert_eq!(migrator.state().cursor, CURSOR_START);

        // The initial state is durable before any row is read.
        assert!(destination.has_checkpoint_table());
        assert_eq!(destination.checkpoint(&target()).unwrap().state, expected);
        assert!(destination.row_keys("messages").is_empty());
    }

    #[tokio::test]
    async fn resumes_from_stored_checkpoint() {
        let source = source(1..=2500);
        let destination = MemoryDestination::new("id");
        let mut stored = MigrationState::new(pos(900), 2500);
        stored.cursor = 2000;
        destination.put_checkpoint(Checkpoint::new(&target(), stored.clone()));

        let migrator = prepared(&source, &destination).await;
        assert!(source.queries().is_empty());
        assert_eq!(migrator.state(), &stored);

        // A full final batch leaves the flag unset; the cursor says otherwise.
        let mut done = MigrationState::new(pos(900), 2000);
        done.cursor = 2000;
        destination.put_checkpoint(Checkpoint::new(&target(), done));
        let migrator = prepared(&source, &destination).await;
        assert!(migrator.state().migrated);
    }

    #[tokio::test]
    async fn setup_errors_are_returned() {
        let source = source(1..=10);
        let destination = MemoryDestination::new("id");
        source.fail_next_query("Access denied; you need the REPLICATION CLIENT privilege");
        let err = Migrator::prepare(
            target(),
            MigrationConfig::default(),
            source.clone(),
            destination.clone(),
            Metrics::register_into(&Registry::new(), &target()).unwrap(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("REPLICATION CLIENT"), "{err}");
        assert!(destination.checkpoint(&target()).is_none());
    }

    #[tokio::test]
    async fn change_batches_go_first() {
        let source = source(1..=2500);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;
        let (tx, mut rx) = mpsc::channel(16);

        tx.send(replace_batch(&target(), &COLUMNS, row(2501, "t1", "new"), pos(500)))
            .await
            .unwrap();
        tx.send(replace_batch(&target(), &COLUMNS, row(2502, "t1", "new"), pos(600)))
            .await
            .unwrap();

        assert_eq!(
            migrator.tick(&mut rx).await.unwrap(),
            Tick::AppliedBatch { statements: 1 }
        );
        assert_eq!(
            migrator.tick(&mut rx).await.unwrap(),
            Tick::AppliedBatch { statements: 1 }
        );
        assert_eq!(migrator.state().cursor, CURSOR_START);
        assert_eq!(destination.row_keys("messages"), vec![2501, 2502]);

        assert_eq!(
            migrator.tick(&mut rx).await.unwrap(),
            Tick::Copied(CopyOutcome {
                rows: 1000,
                converged: false
            })
        );
    }

    #[tokio::test]
    async fn example_scenario() {
        let source = source(1..=2500);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;
        assert_eq!(migrator.state().bound, 2500);
        let (tx, mut rx) = mpsc::channel(16);

        let copied = |rows, converged| Tick::Copied(CopyOutcome { rows, converged });
        assert_eq!(migrator.tick(&mut rx).await.unwrap(), copied(1000, false));

        // Row 2501 is committed after the bound was taken.
        source.insert(row(2501, "t1", "v1"));
        tx.send(replace_batch(&target(), &COLUMNS, row(2501, "t1", "v1"), pos(700)))
            .await
            .unwrap();
        assert_eq!(
            migrator.tick(&mut rx).await.unwrap(),
            Tick::AppliedBatch { statements: 1 }
        );
        assert!(destination.row("messages", 2501).is_some());
        assert_eq!(migrator.state().cursor, 1000);

        assert_eq!(migrator.tick(&mut rx).await.unwrap(), copied(1000, false));
        assert_eq!(migrator.tick(&mut rx).await.unwrap(), copied(500, true));
        assert_eq!(migrator.tick(&mut rx).await.unwrap(), Tick::Idle);

        assert_eq!(destination.row_keys("messages"), (1..=2501).collect::<Vec<_>>());
        let checkpoint = destination.checkpoint(&target()).unwrap();
        assert_eq!(checkpoint.state.cursor, 2500);
        assert!(checkpoint.state.migrated);
        assert_eq!(checkpoint.state.position, pos(700));

        // The backfill never read past the bound.
        for query in source.queries() {
            if let SourceQuery::Range { upto, .. } = query {
                assert_eq!(upto, 2500);
            }
        }
    }

    #[tokio::test]
    async fn rows_above_bound_only_arrive_through_the_stream() {
        let source = source(1..=10);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;
        let (tx, mut rx) = mpsc::channel(16);

        source.insert(row(11, "t1", "late"));
        while migrator.tick(&mut rx).await.unwrap() != Tick::Idle {}
        assert_eq!(destination.row_keys("messages"), (1..=10).collect::<Vec<_>>());

        tx.send(replace_batch(&target(), &COLUMNS, row(11, "t1", "late"), pos(800)))
            .await
            .unwrap();
        migrator.tick(&mut rx).await.unwrap();
        assert_eq!(destination.row("messages", 11), Some(row(11, "t1", "late")));
    }

    #[tokio::test]
    async fn batches_apply_in_received_order() {
        let source = source(1..=0);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;
        let (tx, mut rx) = mpsc::channel(16);

        let batches = vec![
            replace_batch(&target(), &COLUMNS, row(1, "t1", "a"), pos(100)),
            replace_batch(&target(), &COLUMNS, row(1, "t1", "b"), pos(200)),
            delete_batch(&target(), 1, pos(300)),
            replace_batch(&target(), &COLUMNS, row(1, "t1", "c"), pos(400)),
            replace_batch(&target(), &COLUMNS, row(2, "t1", "d"), pos(500)),
        ];
        let expected: Vec<Statement> = batches
            .iter()
            .flat_map(|batch| batch.statements.clone())
            .collect();
        for batch in batches {
            tx.send(batch).await.unwrap();
        }

        while migrator.tick(&mut rx).await.unwrap() != Tick::Idle {}
        assert_eq!(destination.statements(), expected);
        assert_eq!(destination.row("messages", 1), Some(row(1, "t1", "c")));
        assert_eq!(migrator.state().position, pos(500));
    }

    #[tokio::test]
    async fn reapplying_a_batch_converges() {
        let source = source(1..=0);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;

        let batch = WriteBatch::new(
            vec![
                Statement::Replace {
                    table: "messages".into(),
                    columns: COLUMNS.iter().map(|c| c.to_string()).collect(),
                    rows: vec![row(5, "t1", "x"), row(6, "t1", "y")],
                },
                Statement::Delete {
                    table: "messages".into(),
                    key_column: "id".into(),
                    key: Value::Int(5),
                },
            ],
            pos(1000),
        );
        migrator.apply_batch(batch.clone()).await.unwrap();
        let once = destination.rows("messages");
        migrator.apply_batch(batch).await.unwrap();
        assert_eq!(destination.rows("messages"), once);
        assert_eq!(once, vec![row(6, "t1", "y")]);
    }

    #[tokio::test]
    async fn failed_batch_keeps_position() {
        let source = source(1..=0);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;

        destination.fail_next_write("Deadlock found when trying to get lock");
        let err = migrator
            .apply_batch(delete_batch(&target(), 1, pos(999)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(migrator.state().position, pos(4));
        assert_eq!(destination.checkpoint(&target()).unwrap().state.position, pos(4));
    }

    #[tokio::test]
    async fn position_only_batch_stores_position() {
        let source = source(1..=3);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;
        let (tx, mut rx) = mpsc::channel(16);

        let far = ReplicationPosition::new("mysql-bin.000099", 5000);
        tx.send(WriteBatch::new(vec![], far.clone())).await.unwrap();
        assert_eq!(
            migrator.tick(&mut rx).await.unwrap(),
            Tick::AppliedBatch { statements: 0 }
        );
        assert_eq!(migrator.state().position, far);
        assert_eq!(migrator.state().cursor, CURSOR_START);
        let stored = destination.checkpoint(&target()).unwrap().state;
        assert_eq!(stored.position, far);
        assert!(destination.row_keys("messages").is_empty());
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let source = source(1..=0);
        let destination = MemoryDestination::new("id");
        let mut migrator = prepared(&source, &destination).await;
        let (tx, mut rx) = mpsc::channel(16);

        tx.send(delete_batch(&target(), 1, pos(10))).await.unwrap();
        drop(tx);
        // Queued batches are still applied first.
        assert_eq!(
            migrator.tick(&mut rx).await.unwrap(),
            Tick::AppliedBatch { statements: 1 }
        );
        let err = migrator.tick(&mut rx).await.unwrap_err();
        assert!(matches!(err, MigrateError::StreamClosed), "{err:?}");
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn run_converges_and_follows_the_stream() {
        let source = source(1..=2500);
        let destination = MemoryDestination::new("id");
        let migrator = prepared(&source, &destination).await;
        let (stream, handle) = ManualStream::new();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(migrator.run(stream, shutdown.clone()));
        wait_for(|| destination.row_keys("messages").len() == 2500).await;
        assert_eq!(handle.started_at(), Some(pos(4)));

        // While idle, new batches are picked up.
        assert!(handle.send(replace_batch(&target(), &COLUMNS, row(2501, "t1", "n"), pos(50))));
        wait_for(|| destination.row("messages", 2501).is_some()).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        let checkpoint = destination.checkpoint(&target()).unwrap();
        assert!(checkpoint.state.migrated);
        assert_eq!(checkpoint.state.position, pos(50));
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_stream_errors() {
        let source = source(1..=10);
        let destination = MemoryDestination::new("id");
        let migrator = prepared(&source, &destination).await;
        let (stream, handle) = ManualStream::new();

        handle.fail("binlog stream ended");
        let err = migrator
            .run(stream, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, MigrateError::Stream(msg) if msg == "binlog stream ended"),
            "{err:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_write_errors() {
        let source = source(1..=10);
        let destination = MemoryDestination::new("id");
        let migrator = prepared(&source, &destination).await;
        let (stream, _handle) = ManualStream::new();

        destination.fail_next_write("MySQL server has gone away");
        let err = migrator
            .run(stream, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Destination(_)), "{err:?}");
        assert_eq!(
            destination.checkpoint(&target()).unwrap().state.cursor,
            CURSOR_START
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start() {
        let source = source(1..=10);
        let destination = MemoryDestination::new("id");
        let migrator = prepared(&source, &destination).await;
        let (stream, _handle) = ManualStream::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        migrator.run(stream, shutdown).await.unwrap();
        assert!(destination.row_keys("messages").is_empty());
    }
}
