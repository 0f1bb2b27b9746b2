//! CRUD operations for [`Conversation`] records.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{MessageKey, Recipient, ThreadId};

use crate::database::{json_from_sql, ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::messages::{
    delete_message_row, insert_message, replace_message, select_latest_visible, select_message,
    select_thread_messages,
};
use crate::models::{Conversation, ConversationStatus, Message};
use crate::outbox::upsert_outbox_row;

/// Result of [`Database::append_message`].
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub conversation: Conversation,
    /// Timestamp marker inserted ahead of the message, if any.
    pub marker: Option<Message>,
    /// `true` when a message with the same key already existed and was
    /// replaced in place instead of appended.
    pub replaced: bool,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the conversation for the recipient's thread, creating it if
    /// needed.  Calling this twice never creates a second row.
    pub fn upsert_conversation(&mut self, recipient: &Recipient) -> Result<Conversation> {
        let thread_id = recipient.thread_id();
        ensure_conversation(self.conn(), recipient)?;
        load_conversation(self.conn(), &thread_id)?.ok_or(StoreError::NotFound)
    }

    /// Append a message to the recipient's conversation in one transaction.
    ///
    /// A timestamp marker goes in first when the thread has no visible
    /// message yet or the previous one is older than `marker_gap`.  The
    /// unread counter moves by one iff `count_unread` is set.  A message
    /// whose key is already stored is replaced in place, leaving ordering
    /// and counters alone.
    pub fn append_message(
        &mut self,
        recipient: &Recipient,
        message: &Message,
        count_unread: bool,
        marker_gap: Duration,
    ) -> Result<AppendOutcome> {
        self.append_within(recipient, message, count_unread, marker_gap, false)
    }

    /// Same as [`append_message`](Self::append_message), and records an
    /// outbox entry for the message in the same transaction.
    pub fn append_and_queue_message(
        &mut self,
        recipient: &Recipient,
        message: &Message,
        count_unread: bool,
        marker_gap: Duration,
    ) -> Result<AppendOutcome> {
        self.append_within(recipient, message, count_unread, marker_gap, true)
    }

    fn append_within(
        &mut self,
        recipient: &Recipient,
        message: &Message,
        count_unread: bool,
        marker_gap: Duration,
        queue: bool,
    ) -> Result<AppendOutcome> {
        let thread_id = recipient.thread_id();
        let tx = self.conn_mut().transaction()?;

        ensure_conversation(&tx, recipient)?;

        let replaced = select_message(&tx, &message.key)?.is_some();
        let marker = if replaced {
            replace_message(&tx, message)?;
            None
        } else {
            let previous = select_latest_visible(&tx, &thread_id)?;
            let needs_marker = match &previous {
                None => true,
                Some(prev) => message.created_at - prev.created_at > marker_gap,
            };

            let marker = if needs_marker && !message.is_timestamp_marker() {
                let marker = Message::timestamp_marker(message);
                insert_message(&tx, &thread_id, &marker)?;
                Some(marker)
            } else {
                None
            };

            insert_message(&tx, &thread_id, message)?;

            tx.execute(
                "UPDATE conversations
                 SET latest_message_key = ?1,
                     updated_at = ?2,
                     unread_count = unread_count + ?3
                 WHERE thread_id = ?4",
                params![
                    message.key.to_string(),
                    ts_to_sql(&Utc::now()),
                    if count_unread { 1 } else { 0 },
                    thread_id.as_str(),
                ],
            )?;
            marker
        };

        if queue {
            upsert_outbox_row(&tx, recipient, &message.key)?;
        }

        tx.commit()?;

        let conversation =
            load_conversation(self.conn(), &thread_id)?.ok_or(StoreError::NotFound)?;
        Ok(AppendOutcome {
            conversation,
            marker,
            replaced,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a conversation with all of its messages.
    pub fn get_conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        load_conversation(self.conn(), thread_id)
    }

    /// Non-empty conversations, most recent activity first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.thread_id
             FROM conversations c
             WHERE EXISTS (SELECT 1 FROM messages m WHERE m.thread_id = c.thread_id)
             ORDER BY c.updated_at DESC,
                      (SELECT MAX(seq) FROM messages m WHERE m.thread_id = c.thread_id) DESC",
        )?;

        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(conversation) = load_conversation(self.conn(), &ThreadId(id))? {
                conversations.push(conversation);
            }
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Replace the message with the same key.  Ordering, unread counter and
    /// activity timestamp are left untouched.
    pub fn update_message(&mut self, message: &Message) -> Result<ThreadId> {
        let tx = self.conn_mut().transaction()?;
        let (thread_id, _) = select_message(&tx, &message.key)?.ok_or(StoreError::NotFound)?;
        replace_message(&tx, message)?;
        tx.commit()?;
        Ok(thread_id)
    }

    pub fn reset_unread(&self, thread_id: &ThreadId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET unread_count = 0 WHERE thread_id = ?1 AND unread_count != 0",
            params![thread_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn set_muted(&self, thread_id: &ThreadId, muted: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET is_muted = ?1 WHERE thread_id = ?2",
            params![muted as i32, thread_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn set_accepted(&self, thread_id: &ThreadId, accepted: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET is_accepted = ?1 WHERE thread_id = ?2",
            params![accepted as i32, thread_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove a message by key and repoint the latest-message pointer.
    /// Returns the thread the message belonged to, if it existed.
    pub fn delete_message(&mut self, key: &MessageKey) -> Result<Option<ThreadId>> {
        let tx = self.conn_mut().transaction()?;

        let Some((thread_id, _)) = select_message(&tx, key)? else {
            return Ok(None);
        };

        delete_message_row(&tx, key)?;
        tx.execute(
            "DELETE FROM pending_transactions WHERE message_key = ?1",
            params![key.to_string()],
        )?;

        let latest = select_latest_visible(&tx, &thread_id)?;
        tx.execute(
            "UPDATE conversations SET latest_message_key = ?1 WHERE thread_id = ?2",
            params![latest.map(|m| m.key.to_string()), thread_id.as_str()],
        )?;

        tx.commit()?;
        Ok(Some(thread_id))
    }

    /// Delete a conversation.  ON DELETE CASCADE takes its messages and
    /// their outbox entries; pending transactions are removed explicitly.
    pub fn delete_conversation(&mut self, thread_id: &ThreadId) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM pending_transactions
             WHERE message_key IN (SELECT private_key FROM messages WHERE thread_id = ?1)",
            params![thread_id.as_str()],
        )?;
        let affected = tx.execute(
            "DELETE FROM conversations WHERE thread_id = ?1",
            params![thread_id.as_str()],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_conversation(conn: &Connection, recipient: &Recipient) -> Result<()> {
    let now = ts_to_sql(&Utc::now());
    conn.execute(
        "INSERT OR IGNORE INTO conversations (thread_id, recipient, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![
            recipient.thread_id().as_str(),
            serde_json::to_string(recipient)?,
            now,
        ],
    )?;
    Ok(())
}

struct ConversationRow {
    recipient: Recipient,
    latest_message_key: Option<String>,
    unread_count: u32,
    status: ConversationStatus,
    updated_at: chrono::DateTime<Utc>,
}

fn load_conversation(conn: &Connection, thread_id: &ThreadId) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT recipient, latest_message_key, unread_count, is_muted, is_accepted, updated_at
             FROM conversations WHERE thread_id = ?1",
            params![thread_id.as_str()],
            row_to_conversation,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let messages = select_thread_messages(conn, thread_id)?;
    let latest_message = row
        .latest_message_key
        .as_deref()
        .and_then(|key| messages.iter().find(|m| m.key.to_string() == key))
        .cloned();

    Ok(Some(Conversation {
        thread_id: thread_id.clone(),
        recipient: row.recipient,
        messages,
        latest_message,
        unread_count: row.unread_count,
        status: row.status,
        updated_at: row.updated_at,
    }))
}

/// Map a `rusqlite::Row` to a [`ConversationRow`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let recipient_json: String = row.get(0)?;
    let latest_message_key: Option<String> = row.get(1)?;
    let unread_count: u32 = row.get(2)?;
    let is_muted: i32 = row.get(3)?;
    let is_accepted: i32 = row.get(4)?;
    let updated_str: String = row.get(5)?;

    Ok(ConversationRow {
        recipient: json_from_sql(0, &recipient_json)?,
        latest_message_key,
        unread_count,
        status: ConversationStatus {
            is_muted: is_muted != 0,
            is_accepted: is_accepted != 0,
        },
        updated_at: ts_from_sql(5, &updated_str)?,
    })
}
