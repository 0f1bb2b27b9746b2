//! Row-level operations for [`Message`] records.
//!
//! The free functions take a plain [`Connection`] so that they can run
//! inside the transactions opened by the conversation operations.

use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{MessageKey, ThreadId};

use crate::database::{json_from_sql, ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::Message;

const MESSAGE_COLUMNS: &str =
    "private_key, sender, payload, attachment, send_state, created_at, thread_id";

impl Database {
    /// Fetch a message and the thread it belongs to.
    pub fn get_message(&self, key: &MessageKey) -> Result<Option<(ThreadId, Message)>> {
        select_message(self.conn(), key)
    }

    /// All messages of a thread in insertion order.
    pub fn get_messages_for_thread(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        select_thread_messages(self.conn(), thread_id)
    }

    /// Payment message carrying `tx_hash`, if any.
    pub fn find_payment_message(&self, tx_hash: &str) -> Result<Option<(ThreadId, Message)>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE kind = 'payment' AND json_extract(payload, '$.Payment.tx_hash') = ?1
                     LIMIT 1"
                ),
                params![tx_hash],
                |row| {
                    let thread_id: String = row.get(6)?;
                    Ok((ThreadId(thread_id), row_to_message(row)?))
                },
            )
            .optional()?;
        Ok(found)
    }
}

pub(crate) fn insert_message(conn: &Connection, thread_id: &ThreadId, message: &Message) -> Result<()> {
    let payload = serde_json::to_string(&message.payload)?;
    conn.execute(
        "INSERT INTO messages (private_key, thread_id, sender, kind, payload, attachment, send_state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.key.to_string(),
            thread_id.as_str(),
            message.sender,
            message.payload.kind(),
            payload,
            message.attachment,
            message.send_state.as_str(),
            ts_to_sql(&message.created_at),
        ],
    )?;
    Ok(())
}

/// Overwrite every mutable column of the message with the same key.
/// Returns `false` when no such message exists.
pub(crate) fn replace_message(conn: &Connection, message: &Message) -> Result<bool> {
    let payload = serde_json::to_string(&message.payload)?;
    let affected = conn.execute(
        "UPDATE messages
         SET sender = ?1, kind = ?2, payload = ?3, attachment = ?4, send_state = ?5, created_at = ?6
         WHERE private_key = ?7",
        params![
            message.sender,
            message.payload.kind(),
            payload,
            message.attachment,
            message.send_state.as_str(),
            ts_to_sql(&message.created_at),
            message.key.to_string(),
        ],
    )?;
    Ok(affected > 0)
}

pub(crate) fn select_message(
    conn: &Connection,
    key: &MessageKey,
) -> Result<Option<(ThreadId, Message)>> {
    let found = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE private_key = ?1"),
            params![key.to_string()],
            |row| {
                let thread_id: String = row.get(6)?;
                Ok((ThreadId(thread_id), row_to_message(row)?))
            },
        )
        .optional()?;
    Ok(found)
}

pub(crate) fn select_thread_messages(conn: &Connection, thread_id: &ThreadId) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY seq ASC"
    ))?;

    let rows = stmt.query_map(params![thread_id.as_str()], row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Last message of a thread that counts toward display.
pub(crate) fn select_latest_visible(conn: &Connection, thread_id: &ThreadId) -> Result<Option<Message>> {
    let latest = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE thread_id = ?1 AND kind != 'timestamp'
                 ORDER BY seq DESC LIMIT 1"
            ),
            params![thread_id.as_str()],
            row_to_message,
        )
        .optional()?;
    Ok(latest)
}

pub(crate) fn delete_message_row(conn: &Connection, key: &MessageKey) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM messages WHERE private_key = ?1",
        params![key.to_string()],
    )?;
    Ok(affected > 0)
}

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    row_to_message_at(row, 0)
}

/// Decode a message whose columns start at index `base`, in the order of
/// `MESSAGE_COLUMNS`.
pub(crate) fn row_to_message_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Message> {
    let key_str: String = row.get(base)?;
    let sender: String = row.get(base + 1)?;
    let payload_json: String = row.get(base + 2)?;
    let attachment: Option<String> = row.get(base + 3)?;
    let state_str: String = row.get(base + 4)?;
    let ts_str: String = row.get(base + 5)?;

    let key = MessageKey::parse(&key_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(base, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let payload = json_from_sql(base + 2, &payload_json)?;
    let send_state = state_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(base + 4, rusqlite::types::Type::Text, e.into())
    })?;
    let created_at = ts_from_sql(base + 5, &ts_str)?;

    Ok(Message {
        key,
        sender,
        payload,
        created_at,
        attachment,
        send_state,
    })
}
