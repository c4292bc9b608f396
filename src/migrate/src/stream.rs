// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The change stream: committed source transactions touching the tenant's rows,
//! already translated into destination writes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MigrateError;
use crate::statement::Statement;

pub mod binlog;
pub mod cursor;
pub mod translate;

/// A coordinate in the source's change log.
pub type ReplicationPosition = sm_mysql_util::BinlogPosition;

/// The writes of one committed source transaction, scoped to the tenant.
///
/// A batch is applied as a unit and in the order it was received. A batch
/// without statements only moves the stored position.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub statements: Vec<Statement>,
    /// The coordinate right after the commit that closed this batch. A stream
    /// restarted from here begins with the next transaction.
    pub position: ReplicationPosition,
}

impl WriteBatch {
    pub fn new(statements: Vec<Statement>, position: ReplicationPosition) -> Self {
        WriteBatch {
            statements,
            position,
        }
    }
}

/// Produces [`WriteBatch`]es for every transaction committed after a given
/// coordinate, in commit order.
///
/// Implementations publish into a bounded channel and so block whenever the
/// migrator falls behind. They run until the receiving end is dropped, at
/// which point they return `Ok(())`; any other exit is an error.
#[async_trait]
pub trait ChangeStream: Send + Sized + 'static {
    async fn run(
        self,
        start: ReplicationPosition,
        batches: mpsc::Sender<WriteBatch>,
    ) -> Result<(), MigrateError>;
}
