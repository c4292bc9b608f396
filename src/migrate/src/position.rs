// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tracing::info;

use crate::error::MigrateError;
use crate::shard::{SourceQuery, SourceShard};
use crate::statement::value_to_key;
use crate::stream::ReplicationPosition;

/// Determines the source's current binlog coordinate.
///
/// This must happen before the snapshot bound is read: every change committed
/// after the returned coordinate is guaranteed to show up in a change stream
/// started from it, so no write can slip between the backfill's view of the
/// table and the start of streaming.
pub async fn resolve_position<S>(source: &mut S) -> Result<ReplicationPosition, MigrateError>
where
    S: SourceShard + ?Sized,
{
    let query = SourceQuery::BinlogPosition;
    let result = source.query(&query).await?;

    let row = match result.rows.as_slice() {
        [row] => row,
        // No row means binary logging is disabled on the server.
        [] => {
            return Err(MigrateError::Setup(
                "source reports no binlog status; is log_bin enabled?".to_string(),
            ));
        }
        rows => {
            return Err(MigrateError::QueryShape {
                query: query.to_string(),
                detail: format!("{} rows", rows.len()),
            });
        }
    };

    let file = &row[result.require_column("File")?];
    let file = match file {
        mysql_async::Value::Bytes(bytes) if !bytes.is_empty() => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        other => {
            return Err(MigrateError::QueryShape {
                query: query.to_string(),
                detail: format!("invalid binlog file {}", other.as_sql(false)),
            });
        }
    };
    let offset = value_to_key(&row[result.require_column("Position")?])?;
    let offset = u64::try_from(offset).map_err(|_| MigrateError::InvalidKey {
        value: offset.to_string(),
    })?;

    let position = ReplicationPosition::new(file, offset);
    info!(%position, "resolved source binlog position");
    Ok(position)
}
