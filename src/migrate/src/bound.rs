// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use mysql_async::Value;
use tracing::info;

use crate::checkpoint::CURSOR_START;
use crate::config::MigrationTarget;
use crate::error::MigrateError;
use crate::shard::{SourceQuery, SourceShard};
use crate::statement::value_to_key;

/// Determines the snapshot bound: the highest primary key the tenant has on the
/// source right now.
///
/// Anything that does not come back as exactly one row with one integer column
/// means the table is not what we think it is, and is reported as an error
/// rather than retried. A tenant without rows yields SQL `NULL`, which maps to
/// [`CURSOR_START`]: there is nothing to backfill.
pub async fn resolve_bound<S>(source: &mut S, target: &MigrationTarget) -> Result<i64, MigrateError>
where
    S: SourceShard + ?Sized,
{
    let query = SourceQuery::MaxKey {
        target: target.clone(),
    };
    let result = source.query(&query).await?;

    if result.rows.len() != 1 {
        return Err(MigrateError::QueryShape {
            query: query.to_string(),
            detail: format!("{} rows", result.rows.len()),
        });
    }
    if result.columns.len() != 1 {
        return Err(MigrateError::QueryShape {
            query: query.to_string(),
            detail: format!("{} columns", result.columns.len()),
        });
    }

    let bound = match &result.rows[0][..] {
        [Value::NULL] => CURSOR_START,
        [value] => value_to_key(value)?,
        values => {
            return Err(MigrateError::QueryShape {
                query: query.to_string(),
                detail: format!("{} values in a row", values.len()),
            });
        }
    };

    info!(%target, bound, "resolved snapshot bound");
    Ok(bound)
}
