// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Online migration of one tenant's rows between MySQL shards.
//!
//! A migration copies the rows that exist when it starts (the backfill) while
//! replaying every change committed on the source since then (the change
//! stream), until the destination holds the tenant's data and keeps up with
//! the source. See [`orchestrator::Migrator`] for how the two are scheduled.

pub mod backfill;
pub mod bound;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mysql;
pub mod orchestrator;
pub mod position;
pub mod shard;
pub mod statement;
pub mod stream;
#[cfg(any(test, feature = "test"))]
pub mod testing;

pub use crate::checkpoint::{CURSOR_START, Checkpoint, MigrationState};
pub use crate::config::{MigrationConfig, MigrationTarget};
pub use crate::error::MigrateError;
pub use crate::orchestrator::{Migrator, Tick};
pub use crate::stream::{ChangeStream, ReplicationPosition, WriteBatch};
