// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Translation of binlog row images into destination writes.
//!
//! Row events carry whole-row images without column names, so translation
//! works against the table's column list in ordinal order. Only rows of the
//! migrated tenant produce writes.

use mysql_async::Value;

use crate::config::MigrationTarget;
use crate::error::MigrateError;
use crate::statement::{Statement, value_matches_key, value_to_key};
use crate::stream::{ReplicationPosition, WriteBatch};

/// The columns of the migrated table in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    columns: Vec<String>,
    key_index: usize,
    tenant_index: usize,
}

impl TableLayout {
    pub fn new(target: &MigrationTarget, columns: Vec<String>) -> Result<Self, MigrateError> {
        let find = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| MigrateError::MissingColumn(name.to_string()))
        };
        let key_index = find(&target.primary_key_column)?;
        let tenant_index = find(&target.tenant_column)?;
        Ok(TableLayout {
            columns,
            key_index,
            tenant_index,
        })
    }
}

/// One row-level change decoded from a rows event.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert(Vec<Value>),
    Update { before: Vec<Value>, after: Vec<Value> },
    Delete(Vec<Value>),
}

impl RowChange {
    /// Classifies a `(before, after)` image pair as found in rows events.
    pub fn from_images(before: Option<Vec<Value>>, after: Option<Vec<Value>>) -> Option<Self> {
        match (before, after) {
            (None, Some(after)) => Some(RowChange::Insert(after)),
            (Some(before), Some(after)) => Some(RowChange::Update { before, after }),
            (Some(before), None) => Some(RowChange::Delete(before)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Translator {
    target: MigrationTarget,
    layout: TableLayout,
}

impl Translator {
    pub fn new(target: MigrationTarget, layout: TableLayout) -> Self {
        Translator { target, layout }
    }

    fn check(&self, image: &[Value]) -> Result<(), MigrateError> {
        if image.len() != self.layout.columns.len() {
            // A column was added or dropped since the layout was loaded.
            return Err(MigrateError::Stream(format!(
                "row image of {} has {} values, expected {}",
                self.target.table,
                image.len(),
                self.layout.columns.len()
            )));
        }
        Ok(())
    }

    fn owned(&self, image: &[Value]) -> bool {
        value_matches_key(&image[self.layout.tenant_index], &self.target.tenant_key)
    }

    fn replace(&self, image: Vec<Value>) -> Statement {
        Statement::Replace {
            table: self.target.table.clone(),
            columns: self.layout.columns.clone(),
            rows: vec![image],
        }
    }

    fn delete(&self, image: &[Value]) -> Statement {
        Statement::Delete {
            table: self.target.table.clone(),
            key_column: self.target.primary_key_column.clone(),
            key: image[self.layout.key_index].clone(),
        }
    }

    /// The writes that replay `change` on the destination, if it concerns the
    /// tenant.
    pub fn translate(&self, change: RowChange) -> Result<Vec<Statement>, MigrateError> {
        let statements = match change {
            RowChange::Insert(after) => {
                self.check(&after)?;
                if self.owned(&after) {
                    vec![self.replace(after)]
                } else {
                    vec![]
                }
            }
            RowChange::Delete(before) => {
                self.check(&before)?;
                if self.owned(&before) {
                    vec![self.delete(&before)]
                } else {
                    vec![]
                }
            }
            RowChange::Update { before, after } => {
                self.check(&before)?;
                self.check(&after)?;
                let mut statements = vec![];
                let key_changed = value_to_key(&before[self.layout.key_index])?
                    != value_to_key(&after[self.layout.key_index])?;
                // The old key must go when the row leaves the tenant or is
                // renumbered, otherwise the destination keeps a stale copy.
                if self.owned(&before) && (key_changed || !self.owned(&after)) {
                    statements.push(self.delete(&before));
                }
                if self.owned(&after) {
                    statements.push(self.replace(after));
                }
                statements
            }
        };
        Ok(statements)
    }
}

/// Statements of the source transaction currently being read.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    statements: Vec<Statement>,
    /// End of the latest transaction that produced no batch, if no batch was
    /// published since.
    unpublished: Option<ReplicationPosition>,
}

impl TransactionBuffer {
    /// Appends `statement`, folding consecutive single-table replaces into one
    /// multi-row replace. Rows keep their order, so the result is the same.
    pub fn push(&mut self, statement: Statement) {
        if let (
            Some(Statement::Replace {
                table,
                columns,
                rows,
            }),
            Statement::Replace {
                table: next_table,
                columns: next_columns,
                rows: next_rows,
            },
        ) = (self.statements.last_mut(), &statement)
        {
            if table == next_table && columns == next_columns {
                rows.extend(next_rows.iter().cloned());
                return;
            }
        }
        self.statements.push(statement);
    }

    /// Ends the transaction. Transactions that touched none of the tenant's
    /// rows produce no batch; their position is kept for
    /// [`TransactionBuffer::take_progress`].
    pub fn commit(&mut self, position: ReplicationPosition) -> Option<WriteBatch> {
        if self.statements.is_empty() {
            self.unpublished = Some(position);
            return None;
        }
        self.unpublished = None;
        Some(WriteBatch::new(std::mem::take(&mut self.statements), position))
    }

    /// A batch without statements that moves the stored position past the
    /// transactions skipped since the last published batch, if any were.
    pub fn take_progress(&mut self) -> Option<WriteBatch> {
        self.unpublished
            .take()
            .map(|position| WriteBatch::new(Vec::new(), position))
    }
}
