// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Progress of a migration and its durable form.
//!
//! The destination shard stores one checkpoint row per migration target and
//! rewrites it in the same transaction as every data write. A checkpoint
//! therefore never claims progress the destination does not contain, and a
//! restarted migrator can pick up from it without redoing the backfill or
//! losing its place in the binlog.

use serde::{Deserialize, Serialize};

use crate::config::MigrationTarget;
use crate::stream::ReplicationPosition;

/// Cursor value before any row has been copied. Lower than every real key.
pub const CURSOR_START: i64 = i64::MIN;

/// In-memory progress of one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    /// Highest primary key already copied by the backfill.
    pub cursor: i64,
    /// Highest primary key of the tenant when the backfill started. Rows
    /// above it only arrive through the change stream.
    pub bound: i64,
    /// Whether every row in `(CURSOR_START, bound]` has been copied.
    pub migrated: bool,
    /// Binlog coordinate just past the last applied change batch, or the
    /// starting coordinate if none was applied yet.
    pub position: ReplicationPosition,
}

impl MigrationState {
    pub fn new(position: ReplicationPosition, bound: i64) -> Self {
        MigrationState {
            cursor: CURSOR_START,
            bound,
            migrated: false,
            position,
        }
    }

    /// Rebuilds the state from a stored checkpoint.
    ///
    /// Convergence is derived from the cursor and bound instead of trusting
    /// the stored flag alone, since the final backfill batch may have been
    /// full-sized.
    pub fn restore(checkpoint: Checkpoint) -> Self {
        let mut state = checkpoint.state;
        state.migrated = state.migrated || state.cursor >= state.bound;
        state
    }

    /// Number of keys left in the backfill range, as an upper bound on rows.
    pub fn remaining_keys(&self) -> u64 {
        if self.migrated || self.cursor >= self.bound {
            0
        } else {
            self.bound.abs_diff(self.cursor)
        }
    }
}

/// A [`MigrationState`] together with the identity of the migration it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub table: String,
    pub tenant_key: String,
    pub state: MigrationState,
}

impl Checkpoint {
    pub fn new(target: &MigrationTarget, state: MigrationState) -> Self {
        Checkpoint {
            table: target.table.clone(),
            tenant_key: target.tenant_key.clone(),
            state,
        }
    }

    pub fn belongs_to(&self, target: &MigrationTarget) -> bool {
        self.table == target.table && self.tenant_key == target.tenant_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> ReplicationPosition {
        ReplicationPosition::new("mysql-bin.000001", 157)
    }

    #[test]
    fn restore_recomputes_convergence() {
        let target = MigrationTarget::new("t1");

        let mut state = MigrationState::new(position(), 2000);
        state.cursor = 2000;
        let restored = MigrationState::restore(Checkpoint::new(&target, state));
        assert!(restored.migrated);
        assert_eq!(restored.remaining_keys(), 0);

        let mut state = MigrationState::new(position(), 2500);
        state.cursor = 1000;
        let restored = MigrationState::restore(Checkpoint::new(&target, state.clone()));
        assert!(!restored.migrated);
        assert_eq!(restored.remaining_keys(), 1500);

        state.migrated = true;
        assert!(MigrationState::restore(Checkpoint::new(&target, state)).migrated);
    }

    #[test]
    fn fresh_state_covers_whole_range() {
        let state = MigrationState::new(position(), 10);
        assert_eq!(state.cursor, CURSOR_START);
        assert!(!state.migrated);
        assert!(state.remaining_keys() > 10);

        // An empty tenant resolves its bound to the cursor start.
        let empty = MigrationState::new(position(), CURSOR_START);
        assert_eq!(empty.remaining_keys(), 0);
    }

    #[test]
    fn checkpoint_ownership() {
        let target = MigrationTarget::new("t1");
        let checkpoint = Checkpoint::new(&target, MigrationState::new(position(), 1));
        assert!(checkpoint.belongs_to(&target));
        assert!(!checkpoint.belongs_to(&MigrationTarget::new("t2")));
        assert!(!checkpoint.belongs_to(&target.clone().with_table("orders")));
    }
}
