//! v003 -- Track which group members a queued message already reached.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE pending_outbox
    ADD COLUMN delivered_to TEXT NOT NULL DEFAULT '[]';  -- JSON array of addresses
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
