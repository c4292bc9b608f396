// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sm_mysql_util::quote_identifier;

pub const DEFAULT_TABLE: &str = "messages";
pub const DEFAULT_PRIMARY_KEY_COLUMN: &str = "id";
pub const DEFAULT_TENANT_COLUMN: &str = "tenant_id";
pub const DEFAULT_CHECKPOINT_TABLE: &str = "_shard_migrations";

/// Rows copied per backfill step.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// How long the scheduler waits between checks once the backfill converged.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);
/// Change batches that may be buffered before the stream blocks.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The rows a single migrator is responsible for: every row of `table` whose
/// `tenant_column` equals `tenant_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub table: String,
    /// An integer column, unique and ascending in insertion order.
    pub primary_key_column: String,
    pub tenant_column: String,
    pub tenant_key: String,
}

impl MigrationTarget {
    /// A target using the default table layout.
    pub fn new(tenant_key: impl Into<String>) -> Self {
        MigrationTarget {
            table: DEFAULT_TABLE.to_string(),
            primary_key_column: DEFAULT_PRIMARY_KEY_COLUMN.to_string(),
            tenant_column: DEFAULT_TENANT_COLUMN.to_string(),
            tenant_key: tenant_key.into(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_primary_key_column(mut self, column: impl Into<String>) -> Self {
        self.primary_key_column = column.into();
        self
    }

    pub fn with_tenant_column(mut self, column: impl Into<String>) -> Self {
        self.tenant_column = column.into();
        self
    }

    pub(crate) fn quoted_table(&self) -> String {
        quote_identifier(&self.table)
    }

    pub(crate) fn quoted_primary_key(&self) -> String {
        quote_identifier(&self.primary_key_column)
    }

    pub(crate) fn quoted_tenant_column(&self) -> String {
        quote_identifier(&self.tenant_column)
    }
}

impl fmt::Display for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}={}]",
            self.table, self.tenant_column, self.tenant_key
        )
    }
}

/// Tuning knobs of the migrator that are unrelated to connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub batch_size: usize,
    pub idle_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
