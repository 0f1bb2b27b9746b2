//! Pending outbox: messages waiting for connectivity.
//!
//! Entries hold the message key only.  Reads resolve the current message
//! through the `messages` table, so an entry can never drift from the
//! Conversation Store.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{MessageKey, Recipient};

use crate::database::{json_from_sql, ts_to_sql, Database, SharedDatabase};
use crate::error::Result;
use crate::messages::row_to_message_at;
use crate::models::Message;

/// One outbox row joined with its message, if the message still exists.
type OutboxRow = (MessageKey, Recipient, Option<Message>);

/// Insert the outbox row for `key`, or refresh its recipient.  The original
/// `queued_at` is kept so retries stay in first-queued order.
pub(crate) fn upsert_outbox_row(
    conn: &Connection,
    recipient: &Recipient,
    key: &MessageKey,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_outbox (message_key, recipient, queued_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(message_key) DO UPDATE SET
            recipient = excluded.recipient",
        params![
            key.to_string(),
            serde_json::to_string(recipient)?,
            ts_to_sql(&Utc::now()),
        ],
    )?;
    Ok(())
}

impl Database {
    /// Record (or refresh) the outbox entry for a stored message.
    pub fn save_outbox_entry(&self, recipient: &Recipient, key: &MessageKey) -> Result<()> {
        upsert_outbox_row(self.conn(), recipient, key)
    }

    /// Addresses the queued message already reached.  Empty when the entry
    /// does not exist.
    pub fn outbox_delivered_to(&self, key: &MessageKey) -> Result<Vec<String>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT delivered_to FROM pending_outbox WHERE message_key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Add `addresses` to the delivered set of an existing entry.  Returns
    /// `false` when there is no entry for `key`.
    pub fn mark_outbox_delivered(&mut self, key: &MessageKey, addresses: &[String]) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let json: Option<String> = tx
            .query_row(
                "SELECT delivered_to FROM pending_outbox WHERE message_key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(json) = json else {
            return Ok(false);
        };

        let mut delivered: Vec<String> = serde_json::from_str(&json)?;
        for address in addresses {
            if !delivered.contains(address) {
                delivered.push(address.clone());
            }
        }
        tx.execute(
            "UPDATE pending_outbox SET delivered_to = ?1 WHERE message_key = ?2",
            params![serde_json::to_string(&delivered)?, key.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Every outbox entry joined with its current message, oldest first.
    pub fn list_outbox(&self) -> Result<Vec<OutboxRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT o.message_key, o.recipient,
                    m.private_key, m.sender, m.payload, m.attachment, m.send_state, m.created_at
             FROM pending_outbox o
             LEFT JOIN messages m ON m.private_key = o.message_key
             ORDER BY o.queued_at ASC, o.rowid ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let key_str: String = row.get(0)?;
            let recipient_json: String = row.get(1)?;
            let resolved: Option<String> = row.get(2)?;

            let key = MessageKey::parse(&key_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            let recipient: Recipient = json_from_sql(1, &recipient_json)?;
            let message = match resolved {
                Some(_) => Some(row_to_message_at(row, 2)?),
                None => None,
            };
            Ok((key, recipient, message))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn remove_outbox_entry(&self, key: &MessageKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM pending_outbox WHERE message_key = ?1",
            params![key.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn outbox_contains(&self, key: &MessageKey) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM pending_outbox WHERE message_key = ?1",
            params![key.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Durable queue of messages that must be retried once online.
#[derive(Clone)]
pub struct PendingOutboxStore {
    db: SharedDatabase,
}

impl PendingOutboxStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Record that `message` must be retried.  The message must already be
    /// stored; an existing entry for the same key is overwritten.
    pub fn save(&self, recipient: &Recipient, message: &Message) -> Result<()> {
        self.db.lock()?.save_outbox_entry(recipient, &message.key)?;
        tracing::debug!(msg_key = %message.key, thread = %recipient.thread_id(), "queued in outbox");
        Ok(())
    }

    /// Every pending entry with the current state of its message.
    /// Entries whose message has vanished are skipped.
    pub fn fetch_all(&self) -> Result<Vec<(Recipient, Message)>> {
        let rows = self.db.lock()?.list_outbox()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (key, recipient, message) in rows {
            match message {
                Some(message) => entries.push((recipient, message)),
                None => tracing::warn!(msg_key = %key, "outbox entry without message, skipping"),
            }
        }
        Ok(entries)
    }

    /// Drop the entry for `key`.  Called by the delivery pipeline once a
    /// delivery attempt has resolved the message.
    pub fn remove(&self, key: &MessageKey) -> Result<bool> {
        self.db.lock()?.remove_outbox_entry(key)
    }

    pub fn contains(&self, key: &MessageKey) -> Result<bool> {
        self.db.lock()?.outbox_contains(key)
    }

    /// Group members the queued message already reached.
    pub fn delivered_to(&self, key: &MessageKey) -> Result<Vec<String>> {
        self.db.lock()?.outbox_delivered_to(key)
    }

    /// Remember that the queued message reached `addresses`, so a retry
    /// skips them.
    pub fn mark_delivered(&self, key: &MessageKey, addresses: &[String]) -> Result<bool> {
        if addresses.is_empty() {
            return self.contains(key);
        }
        self.db.lock()?.mark_outbox_delivered(key, addresses)
    }
}
