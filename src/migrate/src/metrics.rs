// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Metrics for tenant migrations.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::checkpoint::MigrationState;
use crate::config::MigrationTarget;

#[derive(Debug, Clone)]
pub struct Metrics {
    /// Change batches applied to the destination.
    pub batches_applied: IntCounter,
    /// Statements contained in applied change batches.
    pub statements_applied: IntCounter,
    /// Backfill batches written to the destination.
    pub backfill_batches: IntCounter,
    /// Rows copied by the backfill.
    pub rows_copied: IntCounter,
    pub cursor: IntGauge,
    pub bound: IntGauge,
    /// 1 once the backfill is complete.
    pub converged: IntGauge,
}

impl Metrics {
    /// Registers the metrics of the migration of `target` into `registry`.
    pub fn register_into(
        registry: &Registry,
        target: &MigrationTarget,
    ) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .const_label("table", target.table.as_str())
                .const_label("tenant", target.tenant_key.as_str())
        };
        let metrics = Metrics {
            batches_applied: IntCounter::with_opts(opts(
                "sm_migrate_change_batches_applied_total",
                "Number of change-stream batches applied to the destination shard.",
            ))?,
            statements_applied: IntCounter::with_opts(opts(
                "sm_migrate_change_statements_applied_total",
                "Number of statements in change-stream batches applied to the destination shard.",
            ))?,
            backfill_batches: IntCounter::with_opts(opts(
                "sm_migrate_backfill_batches_total",
                "Number of backfill batches written to the destination shard.",
            ))?,
            rows_copied: IntCounter::with_opts(opts(
                "sm_migrate_backfill_rows_total",
                "Number of rows copied by the backfill.",
            ))?,
            cursor: IntGauge::with_opts(opts(
                "sm_migrate_backfill_cursor",
                "Highest primary key copied by the backfill.",
            ))?,
            bound: IntGauge::with_opts(opts(
                "sm_migrate_backfill_bound",
                "Highest primary key the backfill will copy.",
            ))?,
            converged: IntGauge::with_opts(opts(
                "sm_migrate_converged",
                "Whether the backfill has completed (1) or not (0).",
            ))?,
        };
        registry.register(Box::new(metrics.batches_applied.clone()))?;
        registry.register(Box::new(metrics.statements_applied.clone()))?;
        registry.register(Box::new(metrics.backfill_batches.clone()))?;
        registry.register(Box::new(metrics.rows_copied.clone()))?;
        registry.register(Box::new(metrics.cursor.clone()))?;
        registry.register(Box::new(metrics.bound.clone()))?;
        registry.register(Box::new(metrics.converged.clone()))?;
        Ok(metrics)
    }

    pub(crate) fn observe_state(&self, state: &MigrationState) {
        self.cursor.set(state.cursor);
        self.bound.set(state.bound);
        self.converged.set(i64::from(state.migrated));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ReplicationPosition;

    #[test]
    fn registers_and_tracks_state() {
        let registry = Registry::new();
        let target = MigrationTarget::new("t1");
        let metrics = Metrics::register_into(&registry, &target).unwrap();

        let mut state = MigrationState::new(ReplicationPosition::new("mysql-bin.000001", 4), 2500);
        state.cursor = 1000;
        metrics.observe_state(&state);
        assert_eq!(metrics.cursor.get(), 1000);
        assert_eq!(metrics.bound.get(), 2500);
        assert_eq!(metrics.converged.get(), 0);

        let families = registry.gather();
        assert_eq!(families.len(), 7);
        let converged = families
            .iter()
            .find(|f| f.get_name() == "sm_migrate_converged")
            .unwrap();
        let labels = converged.get_metric()[0].get_label();
        assert!(labels.iter().any(|l| l.get_name() == "tenant" && l.get_value() == "t1"));

        // The same migration cannot be registered twice.
        assert!(Metrics::register_into(&registry, &target).is_err());
    }
}
