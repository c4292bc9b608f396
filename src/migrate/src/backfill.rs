// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bulk copy of the rows that existed when the migration started.
//!
//! The backfill walks the tenant's rows in ascending primary key order, one
//! bounded batch per step, from the cursor up to the snapshot bound. Each batch
//! is written with a single `REPLACE INTO` so that re-copying a row (after a
//! crash, or because the change stream already wrote it) overwrites instead of
//! failing. The column list is taken from the source result, so tables of any
//! shape are copied verbatim.

use tracing::debug;

use crate::checkpoint::{Checkpoint, MigrationState};
use crate::config::MigrationTarget;
use crate::error::MigrateError;
use crate::shard::{DestinationShard, SourceQuery, SourceShard};
use crate::statement::{Statement, value_to_key};

/// What one backfill step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Rows written to the destination.
    pub rows: usize,
    /// Whether the snapshot range is now fully copied.
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct BackfillCopier {
    target: MigrationTarget,
    batch_size: usize,
}

impl BackfillCopier {
    pub fn new(target: MigrationTarget, batch_size: usize) -> Self {
        BackfillCopier {
            target,
            batch_size: batch_size.max(1),
        }
    }

    /// Copies the next batch of rows in `(state.cursor, state.bound]`.
    ///
    /// On success the cursor moves to the highest copied key, and the state is
    /// marked converged once a batch comes back short. On error `state` is left
    /// untouched, and since the checkpoint is written in the same transaction as
    /// the rows, so is the durable copy: running the step again is safe.
    pub async fn copy_next_batch<S, D>(
        &self,
        source: &mut S,
        destination: &mut D,
        state: &mut MigrationState,
    ) -> Result<CopyOutcome, MigrateError>
    where
        S: SourceShard + ?Sized,
        D: DestinationShard + ?Sized,
    {
        if state.migrated {
            return Ok(CopyOutcome {
                rows: 0,
                converged: true,
            });
        }

        let query = SourceQuery::Range {
            target: self.target.clone(),
            after: state.cursor,
            upto: state.bound,
            limit: self.batch_size,
        };
        let result = source.query(&query).await?;

        let Some(last_row) = result.rows.last() else {
            debug!(migration = %self.target, cursor = state.cursor, "backfill range exhausted");
            state.migrated = true;
            return Ok(CopyOutcome {
                rows: 0,
                converged: true,
            });
        };

        let key_index = result.require_column(&self.target.primary_key_column)?;
        let last_key = value_to_key(&last_row[key_index])?;
        if last_key <= state.cursor || last_key > state.bound {
            return Err(MigrateError::QueryShape {
                query: query.to_string(),
                detail: format!(
                    "key {last_key} outside of ({}, {}]",
                    state.cursor, state.bound
                ),
            });
        }

        let rows = result.rows.len();
        let converged = rows < self.batch_size;
        let mut next = state.clone();
        next.cursor = last_key;
        next.migrated = converged;

        let statement = Statement::Replace {
            table: self.target.table.clone(),
            columns: result.columns,
            rows: result.rows,
        };
        destination
            .exec_strict(&[statement], &Checkpoint::new(&self.target, next.clone()))
            .await?;

        debug!(
            migration = %self.target,
            rows,
            cursor = next.cursor,
            bound = next.bound,
            converged,
            "copied backfill batch"
        );
        *state = next;
        Ok(CopyOutcome { rows, converged })
    }
}
