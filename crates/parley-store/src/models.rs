//! Domain model structs persisted in the local SQLite database.
//!
//! Values returned by the stores are owned snapshots: mutating one changes
//! nothing on disk until it is handed back to a store method.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{MessageKey, Payload, Recipient, SendState, ThreadId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message, payment or local record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Private key; the only identity used to correlate a message.
    pub key: MessageKey,
    /// Wallet address of the author.
    pub sender: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    /// Local path of an attached file, if any.
    pub attachment: Option<String>,
    pub send_state: SendState,
}

impl Message {
    /// Create an outgoing message with a fresh private key, in `Sending`.
    pub fn outgoing(sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            key: MessageKey::new(),
            sender: sender.into(),
            payload,
            created_at: Utc::now(),
            attachment: None,
            send_state: SendState::Sending,
        }
    }

    /// Synthetic marker placed before `next`.
    pub(crate) fn timestamp_marker(next: &Message) -> Self {
        Self {
            key: MessageKey::new(),
            sender: next.sender.clone(),
            payload: Payload::Timestamp,
            created_at: next.created_at,
            attachment: None,
            send_state: SendState::LocalOnly,
        }
    }

    pub fn with_attachment(mut self, path: impl Into<String>) -> Self {
        self.attachment = Some(path.into());
        self
    }

    pub fn with_state(mut self, state: SendState) -> Self {
        self.send_state = state;
        self
    }

    pub fn is_timestamp_marker(&self) -> bool {
        self.payload.is_timestamp_marker()
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationStatus {
    pub is_muted: bool,
    pub is_accepted: bool,
}

/// A conversation with one user or one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub thread_id: ThreadId,
    pub recipient: Recipient,
    /// Chronological (insertion order), timestamp markers included.
    pub messages: Vec<Message>,
    /// Last message that counts toward display (markers excluded).
    pub latest_message: Option<Message>,
    pub unread_count: u32,
    pub status: ConversationStatus,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn find_message(&self, key: &MessageKey) -> Option<&Message> {
        self.messages.iter().find(|m| &m.key == key)
    }
}

// ---------------------------------------------------------------------------
// Pending transaction
// ---------------------------------------------------------------------------

/// A submitted ledger transaction awaiting a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingTransaction {
    pub tx_hash: String,
    /// Message whose payload encodes the payment.
    pub message_key: MessageKey,
    /// Conversation the message lives in, used to route updates.
    pub recipient: Recipient,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trusted identity
// ---------------------------------------------------------------------------

/// Identity key pinned for a remote address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustedIdentity {
    pub address: String,
    pub identity_key: [u8; 32],
    pub trusted_at: DateTime<Utc>,
}
