use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trusted_identities (
    address      TEXT PRIMARY KEY NOT NULL,   -- remote wallet address
    identity_key TEXT NOT NULL,               -- hex-encoded 32-byte identity key
    trusted_at   TEXT NOT NULL                -- RFC-3339
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
