// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL utility library for shard migrations.

use std::time::Duration;

mod connect;
pub use connect::{Config, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TCP_KEEPALIVE, TimeoutConfig};

mod replication;
pub use replication::{
    BINLOG_STATUS_QUERIES, BinlogPosition, ensure_full_row_binlog_format, query_sys_var,
};

#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error("error creating mysql connection with config: {0}")]
    InvalidClientConfig(String),
    #[error("invalid mysql system setting '{setting}'. Expected '{expected}'. Got '{actual}'.")]
    InvalidSystemSetting {
        setting: String,
        expected: String,
        actual: String,
    },
    #[error("unexpected result from '{query}': {detail}")]
    UnexpectedResult { query: String, detail: String },
    #[error("invalid binlog position '{0}'")]
    InvalidBinlogPosition(String),
    /// A mysql_async error.
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),
}

/// Quotes MySQL identifiers. [See MySQL quote_identifier()](https://github.com/mysql/mysql-sys/blob/master/functions/quote_identifier.sql)
pub fn quote_identifier(identifier: &str) -> String {
    let mut escaped = identifier.replace("`", "``");
    escaped.insert(0, '`');
    escaped.push('`');
    escaped
}

// NOTE: this error was renamed between MySQL 5.7 and 8.0
// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_source_fatal_error_reading_binlog
pub const ER_SOURCE_FATAL_ERROR_READING_BINLOG_CODE: u16 = 1236;

// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_parse_error
pub const ER_PARSE_ERROR: u16 = 1064;

#[cfg(test)]
mod tests {

    use super::quote_identifier;

    #[test]
    fn test_identifier_quoting() {
        let expected = vec!["`a`", "`naughty``sql`", "```;naughty;sql;```"];
        let input = ["a", "naughty`sql", "`;naughty;sql;`"]
            .iter()
            .map(|raw_str| quote_identifier(raw_str))
            .collect::<Vec<_>>();
        assert_eq!(expected, input);
    }
}
