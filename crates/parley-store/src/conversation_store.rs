//! Conversation Store: the single source of truth for message state.
//!
//! Wraps a [`SharedDatabase`] and publishes change notifications.  At most
//! one thread is watched at a time (last writer wins); message-level events
//! are published only for that thread, and appends to it do not count as
//! unread.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use tokio::sync::broadcast;

use parley_shared::constants::TIMESTAMP_MARKER_GAP_SECS;
use parley_shared::{MessageKey, Recipient, ThreadId};

use crate::database::SharedDatabase;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Message};

/// Message-level change on the watched thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    NewMessage(Message),
    UpdatedMessage(Message),
    DeletedMessage(MessageKey),
}

/// Conversation-level change, published for every thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationChange {
    Updated(Conversation),
    Deleted(ThreadId),
}

#[derive(Debug, Clone)]
struct ScopedEvent {
    thread_id: ThreadId,
    event: ThreadEvent,
}

#[derive(Clone)]
pub struct ConversationStore {
    db: SharedDatabase,
    watched: Arc<Mutex<Option<ThreadId>>>,
    thread_events: broadcast::Sender<ScopedEvent>,
    changes: broadcast::Sender<ConversationChange>,
    marker_gap: Duration,
}

impl ConversationStore {
    pub fn new(db: SharedDatabase, event_capacity: usize) -> Self {
        let (thread_events, _) = broadcast::channel(event_capacity.max(1));
        let (changes, _) = broadcast::channel(event_capacity.max(1));
        Self {
            db,
            watched: Arc::new(Mutex::new(None)),
            thread_events,
            changes,
            marker_gap: Duration::seconds(TIMESTAMP_MARKER_GAP_SECS),
        }
    }

    /// Override the gap after which a timestamp marker is inserted.
    pub fn with_marker_gap(mut self, gap: Duration) -> Self {
        self.marker_gap = gap;
        self
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn upsert_conversation(&self, recipient: &Recipient) -> Result<Conversation> {
        let conversation = self.db.lock()?.upsert_conversation(recipient)?;
        Ok(conversation)
    }

    /// Append a message and return the updated conversation snapshot.
    pub fn append_message(&self, recipient: &Recipient, message: &Message) -> Result<Conversation> {
        self.append(recipient, message, false)
    }

    /// Append a message and queue it in the pending outbox within the same
    /// transaction, so a crash never leaves an unsent message unqueued.
    pub fn append_queued_message(
        &self,
        recipient: &Recipient,
        message: &Message,
    ) -> Result<Conversation> {
        self.append(recipient, message, true)
    }

    fn append(&self, recipient: &Recipient, message: &Message, queue: bool) -> Result<Conversation> {
        let thread_id = recipient.thread_id();
        let watched = self.is_watched(&thread_id)?;

        let outcome = {
            let mut db = self.db.lock()?;
            if queue {
                db.append_and_queue_message(recipient, message, !watched, self.marker_gap)?
            } else {
                db.append_message(recipient, message, !watched, self.marker_gap)?
            }
        };

        tracing::debug!(
            msg_key = %message.key,
            thread = %thread_id,
            state = %message.send_state,
            replaced = outcome.replaced,
            queued = queue,
            "message appended"
        );

        if outcome.replaced {
            self.publish(&thread_id, ThreadEvent::UpdatedMessage(message.clone()));
        } else {
            if let Some(marker) = outcome.marker {
                self.publish(&thread_id, ThreadEvent::NewMessage(marker));
            }
            self.publish(&thread_id, ThreadEvent::NewMessage(message.clone()));
        }
        self.notify_changed(&outcome.conversation);

        Ok(outcome.conversation)
    }

    /// Replace a stored message by key.  Fails with
    /// [`StoreError::NotFound`] when the key is unknown.
    pub fn update_message(&self, message: &Message) -> Result<Conversation> {
        let conversation = {
            let mut db = self.db.lock()?;
            let thread_id = db.update_message(message)?;
            db.get_conversation(&thread_id)?.ok_or(StoreError::NotFound)?
        };

        tracing::debug!(
            msg_key = %message.key,
            thread = %conversation.thread_id,
            state = %message.send_state,
            "message updated"
        );

        self.publish(
            &conversation.thread_id,
            ThreadEvent::UpdatedMessage(message.clone()),
        );
        self.notify_changed(&conversation);
        Ok(conversation)
    }

    /// Remove a message by key.  Returns `false` if nothing was stored.
    pub fn delete_message(&self, recipient: &Recipient, key: &MessageKey) -> Result<bool> {
        let (thread_id, conversation) = {
            let mut db = self.db.lock()?;
            let Some(thread_id) = db.delete_message(key)? else {
                return Ok(false);
            };
            let conversation = db.get_conversation(&thread_id)?;
            (thread_id, conversation)
        };

        if thread_id != recipient.thread_id() {
            tracing::warn!(
                msg_key = %key,
                thread = %thread_id,
                requested = %recipient.thread_id(),
                "message deleted from a different thread than requested"
            );
        }
        tracing::debug!(msg_key = %key, thread = %thread_id, "message deleted");

        self.publish(&thread_id, ThreadEvent::DeletedMessage(*key));
        if let Some(conversation) = conversation {
            self.notify_changed(&conversation);
        }
        Ok(true)
    }

    /// Delete a conversation with all of its messages.  A watcher of the
    /// thread sees every message go and loses its watch.
    pub fn delete_conversation(&self, thread_id: &ThreadId) -> Result<bool> {
        let removed = {
            let mut db = self.db.lock()?;
            let keys: Vec<MessageKey> = db
                .get_messages_for_thread(thread_id)?
                .into_iter()
                .map(|message| message.key)
                .collect();
            if !db.delete_conversation(thread_id)? {
                return Ok(false);
            }
            keys
        };

        tracing::info!(thread = %thread_id, messages = removed.len(), "conversation deleted");

        for key in removed {
            self.publish(thread_id, ThreadEvent::DeletedMessage(key));
        }
        self.unwatch(thread_id)?;
        let _ = self
            .changes
            .send(ConversationChange::Deleted(thread_id.clone()));
        Ok(true)
    }

    pub fn set_muted(&self, thread_id: &ThreadId, muted: bool) -> Result<Conversation> {
        self.update_status(thread_id, |db| db.set_muted(thread_id, muted))
    }

    pub fn accept_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        self.update_status(thread_id, |db| db.set_accepted(thread_id, true))
    }

    fn update_status(
        &self,
        thread_id: &ThreadId,
        apply: impl FnOnce(&crate::Database) -> Result<bool>,
    ) -> Result<Conversation> {
        let conversation = {
            let db = self.db.lock()?;
            if !apply(&db)? {
                return Err(StoreError::NotFound);
            }
            db.get_conversation(thread_id)?.ok_or(StoreError::NotFound)?
        };
        self.notify_changed(&conversation);
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Non-empty conversations, most recent activity first.
    pub fn load_all(&self) -> Result<Vec<Conversation>> {
        self.db.lock()?.list_conversations()
    }

    /// Load a conversation and mark it as read.
    pub fn load_by_thread_id(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        let (reset, conversation) = {
            let db = self.db.lock()?;
            let reset = db.reset_unread(thread_id)?;
            (reset, db.get_conversation(thread_id)?)
        };

        if let (true, Some(conversation)) = (reset, &conversation) {
            self.notify_changed(conversation);
        }
        Ok(conversation)
    }

    /// Current snapshot of a message.
    pub fn get_message(&self, key: &MessageKey) -> Result<Option<Message>> {
        Ok(self.db.lock()?.get_message(key)?.map(|(_, message)| message))
    }

    /// Message and recipient of the payment carrying `tx_hash`.
    pub fn find_payment(&self, tx_hash: &str) -> Result<Option<(Recipient, Message)>> {
        let db = self.db.lock()?;
        let Some((thread_id, message)) = db.find_payment_message(tx_hash)? else {
            return Ok(None);
        };
        let recipient = db
            .get_conversation(&thread_id)?
            .map(|conversation| conversation.recipient)
            .ok_or(StoreError::NotFound)?;
        Ok(Some((recipient, message)))
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Watch a thread, replacing any previously watched one.
    pub fn watch(&self, thread_id: &ThreadId) -> Result<ThreadWatch> {
        let mut watched = self.watched.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(previous) = watched.replace(thread_id.clone()) {
            if &previous != thread_id {
                tracing::debug!(previous = %previous, thread = %thread_id, "watched thread replaced");
            }
        }
        Ok(ThreadWatch {
            thread_id: thread_id.clone(),
            rx: self.thread_events.subscribe(),
            watched: Arc::clone(&self.watched),
        })
    }

    /// Stop watching `thread_id` if it is still the watched thread.
    pub fn unwatch(&self, thread_id: &ThreadId) -> Result<()> {
        let mut watched = self.watched.lock().map_err(|_| StoreError::LockPoisoned)?;
        if watched.as_ref() == Some(thread_id) {
            *watched = None;
        }
        Ok(())
    }

    pub fn watched_thread(&self) -> Result<Option<ThreadId>> {
        let watched = self.watched.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(watched.clone())
    }

    /// Unscoped stream of conversation changes, one per mutation.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ConversationChange> {
        self.changes.subscribe()
    }

    fn is_watched(&self, thread_id: &ThreadId) -> Result<bool> {
        Ok(self.watched_thread()?.as_ref() == Some(thread_id))
    }

    fn publish(&self, thread_id: &ThreadId, event: ThreadEvent) {
        if !matches!(self.is_watched(thread_id), Ok(true)) {
            return;
        }
        // No receivers is fine.
        let _ = self.thread_events.send(ScopedEvent {
            thread_id: thread_id.clone(),
            event,
        });
    }

    fn notify_changed(&self, conversation: &Conversation) {
        let _ = self
            .changes
            .send(ConversationChange::Updated(conversation.clone()));
    }
}

/// Receiver of [`ThreadEvent`]s for one thread.
///
/// Dropping it stops observation and releases the watch if nobody has
/// replaced it in the meantime.
pub struct ThreadWatch {
    thread_id: ThreadId,
    rx: broadcast::Receiver<ScopedEvent>,
    watched: Arc<Mutex<Option<ThreadId>>>,
}

impl ThreadWatch {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Next event on this thread, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<ThreadEvent> {
        loop {
            match self.rx.recv().await {
                Ok(scoped) if scoped.thread_id == self.thread_id => return Some(scoped.event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(thread = %self.thread_id, skipped, "thread watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ThreadEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(scoped) if scoped.thread_id == self.thread_id => return Some(scoped.event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for ThreadWatch {
    fn drop(&mut self) {
        if let Ok(mut watched) = self.watched.lock() {
            if watched.as_ref() == Some(&self.thread_id) {
                *watched = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::{Payload, SendState};

    use super::*;
    use crate::Database;

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, ConversationStore::new(db.into_shared(), 64))
    }

    fn text(body: &str) -> Message {
        Message::outgoing("0xme", Payload::text(body))
    }

    #[test]
    fn unread_counts_every_message_on_unwatched_thread() {
        let (_dir, store) = store();
        let bob = Recipient::user("0xb0b");

        for i in 0..5 {
            store.append_message(&bob, &text(&i.to_string())).unwrap();
        }

        let conv = store.load_all().unwrap().remove(0);
        assert_eq!(conv.unread_count, 5);

        let viewed = store.load_by_thread_id(&bob.thread_id()).unwrap().unwrap();
        assert_eq!(viewed.unread_count, 0);
        assert_eq!(store.load_all().unwrap()[0].unread_count, 0);
    }

    #[test]
    fn watched_thread_does_not_accumulate_unread() {
        let (_dir, store) = store();
        let bob = Recipient::user("0xb0b");

        let _watch = store.watch(&bob.thread_id()).unwrap();
        let conv = store.append_message(&bob, &text("hi")).unwrap();
        assert_eq!(conv.unread_count, 0);
    }

    #[tokio::test]
    async fn watch_receives_only_its_thread() {
        let (_dir, store) = store();
        let alice = Recipient::user("0xa11ce");
        let bob = Recipient::user("0xb0b");

        let mut watch = store.watch(&bob.thread_id()).unwrap();

        store.append_message(&alice, &text("not for you")).unwrap();
        let m = text("for bob");
        store.append_message(&bob, &m).unwrap();

        match watch.recv().await.unwrap() {
            ThreadEvent::NewMessage(marker) => assert!(marker.is_timestamp_marker()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(watch.recv().await.unwrap(), ThreadEvent::NewMessage(m.clone()));

        let sent = m.clone().with_state(SendState::Sent);
        store.update_message(&sent).unwrap();
        assert_eq!(watch.recv().await.unwrap(), ThreadEvent::UpdatedMessage(sent));

        store.delete_message(&bob, &m.key).unwrap();
        assert_eq!(watch.recv().await.unwrap(), ThreadEvent::DeletedMessage(m.key));
    }

    #[test]
    fn watching_is_last_writer_wins() {
        let (_dir, store) = store();
        let alice = Recipient::user("0xa11ce");
        let bob = Recipient::user("0xb0b");

        let mut first = store.watch(&alice.thread_id()).unwrap();
        let _second = store.watch(&bob.thread_id()).unwrap();

        let conv = store.append_message(&alice, &text("hey")).unwrap();
        assert_eq!(conv.unread_count, 1);
        assert!(first.try_recv().is_none());
        assert_eq!(store.watched_thread().unwrap(), Some(bob.thread_id()));

        // The stale watch must not clear the newer one.
        drop(first);
        assert_eq!(store.watched_thread().unwrap(), Some(bob.thread_id()));
    }

    #[test]
    fn dropping_watch_releases_thread() {
        let (_dir, store) = store();
        let bob = Recipient::user("0xb0b");

        let watch = store.watch(&bob.thread_id()).unwrap();
        drop(watch);
        assert_eq!(store.watched_thread().unwrap(), None);

        store.watch(&bob.thread_id()).unwrap();
        store.unwatch(&bob.thread_id()).unwrap();
        assert_eq!(store.watched_thread().unwrap(), None);
    }

    #[test]
    fn changes_fire_for_any_conversation() {
        let (_dir, store) = store();
        let mut changes = store.subscribe_changes();
        let alice = Recipient::user("0xa11ce");

        store.append_message(&alice, &text("1")).unwrap();
        store.set_muted(&alice.thread_id(), true).unwrap();

        match changes.try_recv().unwrap() {
            ConversationChange::Updated(conv) => assert_eq!(conv.thread_id, alice.thread_id()),
            other => panic!("unexpected {other:?}"),
        }
        match changes.try_recv().unwrap() {
            ConversationChange::Updated(conv) => assert!(conv.status.is_muted),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deleting_conversation_notifies_and_releases_watch() {
        let (_dir, store) = store();
        let bob = Recipient::user("0xb0b");
        let m = text("soon gone");
        store.append_message(&bob, &m).unwrap();

        let mut watch = store.watch(&bob.thread_id()).unwrap();
        let mut changes = store.subscribe_changes();

        assert!(store.delete_conversation(&bob.thread_id()).unwrap());

        let mut deleted = Vec::new();
        while let Some(event) = watch.try_recv() {
            match event {
                ThreadEvent::DeletedMessage(key) => deleted.push(key),
                other => panic!("unexpected {other:?}"),
            }
        }
        // The timestamp marker goes too.
        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&m.key));

        assert_eq!(
            changes.try_recv().unwrap(),
            ConversationChange::Deleted(bob.thread_id())
        );
        assert_eq!(store.watched_thread().unwrap(), None);
        assert!(!store.delete_conversation(&bob.thread_id()).unwrap());
    }

    #[test]
    fn delete_message_notifies_the_thread_that_held_it() {
        let (_dir, store) = store();
        let alice = Recipient::user("0xa11ce");
        let bob = Recipient::user("0xb0b");
        let m = text("for alice");
        store.append_message(&alice, &m).unwrap();
        store.append_message(&bob, &text("for bob")).unwrap();

        let mut changes = store.subscribe_changes();
        assert!(store.delete_message(&bob, &m.key).unwrap());

        match changes.try_recv().unwrap() {
            ConversationChange::Updated(conv) => {
                assert_eq!(conv.thread_id, alice.thread_id());
                assert!(conv.find_message(&m.key).is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_update_on_missing_thread_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.accept_conversation(&ThreadId::from("0xnobody")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn get_message_reflects_latest_update() {
        let (_dir, store) = store();
        let bob = Recipient::user("0xb0b");
        let m = text("hi");
        store.append_message(&bob, &m).unwrap();
        store
            .update_message(&m.clone().with_state(SendState::Failed))
            .unwrap();

        assert_eq!(
            store.get_message(&m.key).unwrap().unwrap().send_state,
            SendState::Failed
        );
    }
}
