// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed SQL statements and result sets exchanged with the shards.

use itertools::Itertools;
use mysql_async::Value;
use sm_mysql_util::quote_identifier;

use crate::error::MigrateError;

/// A write that can be executed against the destination shard as is.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `REPLACE INTO table (columns) VALUES (..), (..)`: insert each row, or
    /// overwrite the row with the same primary key. Idempotent.
    Replace {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    /// `DELETE FROM table WHERE key_column = key`. Idempotent.
    Delete {
        table: String,
        key_column: String,
        key: Value,
    },
}

impl Statement {
    /// Renders the statement to SQL text and its positional parameters.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            Statement::Replace {
                table,
                columns,
                rows,
            } => {
                let placeholders = format!("({})", columns.iter().map(|_| "?").join(", "));
                let sql = format!(
                    "REPLACE INTO {} ({}) VALUES {}",
                    quote_identifier(table),
                    columns.iter().map(|c| quote_identifier(c)).join(", "),
                    rows.iter().map(|_| placeholders.as_str()).join(", "),
                );
                (sql, rows.iter().flatten().cloned().collect())
            }
            Statement::Delete {
                table,
                key_column,
                key,
            } => (
                format!(
                    "DELETE FROM {} WHERE {} = ?",
                    quote_identifier(table),
                    quote_identifier(key_column)
                ),
                vec![key.clone()],
            ),
        }
    }

    /// A `Replace` without rows renders to invalid SQL and must be skipped.
    pub fn is_noop(&self) -> bool {
        matches!(self, Statement::Replace { rows, .. } if rows.is_empty())
    }
}

/// Rows returned by a query, along with the column names in result order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Like [`ResultSet::column_index`], but missing columns are an error.
    pub fn require_column(&self, name: &str) -> Result<usize, MigrateError> {
        self.column_index(name)
            .ok_or_else(|| MigrateError::MissingColumn(name.to_string()))
    }
}

/// Interprets a primary key value as an integer.
///
/// The text protocol hands back integers as bytes, so both native and textual
/// encodings are accepted.
pub fn value_to_key(value: &Value) -> Result<i64, MigrateError> {
    let invalid = || MigrateError::InvalidKey {
        value: value.as_sql(false),
    };
    match value {
        Value::Int(i) => Ok(*i),
        Value::UInt(u) => i64::try_from(*u).map_err(|_| invalid()),
        Value::Bytes(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Whether a tenant column value equals the tenant key.
pub fn value_matches_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Bytes(bytes) => bytes.as_slice() == key.as_bytes(),
        Value::Int(i) => key.parse::<i64>().is_ok_and(|k| k == *i),
        Value::UInt(u) => key.parse::<u64>().is_ok_and(|k| k == *u),
        _ => false,
    }
}
