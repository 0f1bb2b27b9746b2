//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `conversations`, `messages`,
//! `pending_outbox` and `pending_transactions`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    thread_id          TEXT PRIMARY KEY NOT NULL,   -- user address or group id
    recipient          TEXT NOT NULL,               -- JSON-encoded Recipient
    latest_message_key TEXT,                        -- last non-marker message
    unread_count       INTEGER NOT NULL DEFAULT 0,
    is_muted           INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    is_accepted        INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at         TEXT NOT NULL,               -- RFC-3339, fixed width
    updated_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order
    private_key TEXT NOT NULL UNIQUE,              -- UUID v4
    thread_id   TEXT NOT NULL,                     -- FK -> conversations(thread_id)
    sender      TEXT NOT NULL,                     -- wallet address
    kind        TEXT NOT NULL,                     -- payload tag
    payload     TEXT NOT NULL,                     -- JSON-encoded Payload
    attachment  TEXT,
    send_state  TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (thread_id) REFERENCES conversations(thread_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_seq
    ON messages(thread_id, seq);

-- ----------------------------------------------------------------
-- Pending outbox (messages waiting for connectivity)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_outbox (
    message_key TEXT PRIMARY KEY NOT NULL,   -- FK -> messages(private_key)
    recipient   TEXT NOT NULL,               -- JSON-encoded Recipient
    queued_at   TEXT NOT NULL,

    FOREIGN KEY (message_key) REFERENCES messages(private_key) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Pending transactions (awaiting ledger confirmation)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_transactions (
    tx_hash     TEXT PRIMARY KEY NOT NULL,
    message_key TEXT NOT NULL,               -- may precede the message row
    recipient   TEXT NOT NULL,               -- JSON-encoded Recipient
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_transactions_message
    ON pending_transactions(message_key);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
