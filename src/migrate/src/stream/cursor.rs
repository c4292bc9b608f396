// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transaction boundaries in the binlog.

use crate::stream::ReplicationPosition;

/// The parts of a binlog event that decide where transactions end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The server switched to another binlog file.
    Rotate { file: String },
    /// Row images of some table.
    Rows,
    /// Ends a transaction on a transactional engine.
    Xid,
    /// A statement logged as text, e.g. `BEGIN`, `COMMIT` or DDL.
    Query(String),
    Other,
}

/// Follows the binlog file being read and reports the coordinate of every
/// commit.
#[derive(Debug, Clone)]
pub struct BinlogCursor {
    file: String,
    database: String,
    table: String,
}

impl BinlogCursor {
    /// A cursor reading `table` in `database`, starting in the file of `start`.
    pub fn new(start: &ReplicationPosition, database: &str, table: &str) -> Self {
        BinlogCursor {
            file: start.file.clone(),
            database: database.to_string(),
            table: table.to_string(),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Whether row events of `database.table` concern the migration.
    pub fn wants_rows(&self, database: &str, table: &str) -> bool {
        database == self.database && table == self.table
    }

    /// Moves past an event whose header reports `end` as its end offset.
    /// Returns the coordinate to resume from if the event closed a
    /// transaction.
    pub fn advance(&mut self, event: EventKind, end: u64) -> Option<ReplicationPosition> {
        let committed = match event {
            EventKind::Rotate { file } => {
                self.file = file;
                false
            }
            EventKind::Xid => true,
            // Non-transactional engines end their transactions this way.
            EventKind::Query(query) => query.trim().eq_ignore_ascii_case("COMMIT"),
            EventKind::Rows | EventKind::Other => false,
        };
        committed.then(|| ReplicationPosition::new(self.file.clone(), end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> BinlogCursor {
        BinlogCursor::new(
            &ReplicationPosition::new("mysql-bin.000001", 4),
            "app",
            "messages",
        )
    }

    #[test]
    fn xid_ends_transaction_at_its_end_offset() {
        let mut cursor = cursor();
        assert_eq!(cursor.advance(EventKind::Query("BEGIN".into()), 310), None);
        assert_eq!(cursor.advance(EventKind::Rows, 420), None);
        assert_eq!(
            cursor.advance(EventKind::Xid, 451),
            Some(ReplicationPosition::new("mysql-bin.000001", 451))
        );
    }

    #[test]
    fn commits_after_rotation_use_new_file() {
        let mut cursor = cursor();
        let rotate = EventKind::Rotate {
            file: "mysql-bin.000002".into(),
        };
        assert_eq!(cursor.advance(rotate, 0), None);
        assert_eq!(cursor.file(), "mysql-bin.000002");
        assert_eq!(cursor.advance(EventKind::Rows, 200), None);
        assert_eq!(
            cursor.advance(EventKind::Xid, 231),
            Some(ReplicationPosition::new("mysql-bin.000002", 231))
        );
    }

    #[test]
    fn commit_query_ends_transaction() {
        let mut cursor = cursor();
        assert_eq!(cursor.advance(EventKind::Query("BEGIN".into()), 100), None);
        assert_eq!(
            cursor.advance(EventKind::Query("ALTER TABLE t ADD COLUMN c INT".into()), 150),
            None
        );
        assert_eq!(cursor.advance(EventKind::Other, 170), None);
        assert_eq!(
            cursor.advance(EventKind::Query("commit".into()), 200),
            Some(ReplicationPosition::new("mysql-bin.000001", 200))
        );
    }

    #[test]
    fn only_the_migrated_table_is_read() {
        let cursor = cursor();
        assert!(cursor.wants_rows("app", "messages"));
        assert!(!cursor.wants_rows("app", "users"));
        assert!(!cursor.wants_rows("other", "messages"));
    }
}
