// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

use mysql_async::Conn;
use mysql_async::prelude::Queryable;
use serde::{Deserialize, Serialize};

use crate::MySqlError;

/// Statements that report the server's current binlog coordinate, in the order
/// they should be attempted.
///
/// `SHOW MASTER STATUS` was removed in MySQL 8.4 in favor of
/// `SHOW BINARY LOG STATUS`, which older servers reject as a parse error.
pub const BINLOG_STATUS_QUERIES: [&str; 2] = ["SHOW MASTER STATUS", "SHOW BINARY LOG STATUS"];

/// Query a MySQL System Variable
pub async fn query_sys_var(conn: &mut Conn, name: &str) -> Result<String, MySqlError> {
    let query = format!("SELECT @@{}", name);
    let value: Option<String> = conn.query_first(&query).await?;
    value.ok_or_else(|| MySqlError::UnexpectedResult {
        query,
        detail: "no rows returned".to_string(),
    })
}

/// Verify a MySQL System Variable matches the expected value
async fn verify_sys_setting(
    conn: &mut Conn,
    setting: &str,
    expected: &str,
) -> Result<(), MySqlError> {
    match query_sys_var(conn, setting).await?.as_str() {
        actual if actual == expected => Ok(()),
        actual => Err(MySqlError::InvalidSystemSetting {
            setting: setting.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
    }
}

/// Row-based change capture needs the binlog enabled and every row image
/// written in full, otherwise updates cannot be replayed as whole-row writes.
pub async fn ensure_full_row_binlog_format(conn: &mut Conn) -> Result<(), MySqlError> {
    verify_sys_setting(conn, "log_bin", "1").await?;
    verify_sys_setting(conn, "binlog_format", "ROW").await?;
    verify_sys_setting(conn, "binlog_row_image", "FULL").await?;
    Ok(())
}

/// A coordinate in a MySQL server's binary log: a log file name and a byte
/// offset within it.
///
/// Binlog file names share a base name and a zero-padded sequence suffix
/// (e.g. `mysql-bin.000042`), so ordering by `(file, offset)` follows the
/// order in which the server wrote the events.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        BinlogPosition {
            file: file.into(),
            offset,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl FromStr for BinlogPosition {
    type Err = MySqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // File names may themselves contain colons on exotic setups, so split on
        // the last one.
        let (file, offset) = s
            .rsplit_once(':')
            .ok_or_else(|| MySqlError::InvalidBinlogPosition(s.to_string()))?;
        if file.is_empty() {
            return Err(MySqlError::InvalidBinlogPosition(s.to_string()));
        }
        let offset = offset
            .parse::<u64>()
            .map_err(|_| MySqlError::InvalidBinlogPosition(s.to_string()))?;
        Ok(BinlogPosition::new(file, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binlog_position_display_and_parse() {
        let pos = BinlogPosition::new("mysql-bin.000003", 4);
        assert_eq!(pos.to_string(), "mysql-bin.000003:4");
        assert_eq!("mysql-bin.000003:4".parse::<BinlogPosition>().unwrap(), pos);

        let odd = "host:with:colons.000001:120".parse::<BinlogPosition>().unwrap();
        assert_eq!(odd.file, "host:with:colons.000001");
        assert_eq!(odd.offset, 120);
    }

    #[test]
    fn binlog_position_rejects_garbage() {
        for bad in ["", "mysql-bin.000001", ":12", "mysql-bin.000001:", "f:-1", "f:1x"] {
            assert!(
                bad.parse::<BinlogPosition>().is_err(),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn binlog_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.000001", 9000);
        let b = BinlogPosition::new("mysql-bin.000002", 4);
        let c = BinlogPosition::new("mysql-bin.000002", 157);
        assert!(a < b);
        assert!(b < c);
        let mut all = vec![c.clone(), a.clone(), b.clone()];
        all.sort();
        assert_eq!(all, vec![a, b, c]);
    }
}
