use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::types::{GroupControl, MessageKey, Payload};

/// Everything handed to the secure channel for transmission to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub version: u16,
    pub message: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Chat message, payment or payment request
    Chat(ChatMessage),

    /// Group membership change, sent to every member
    GroupControl(GroupControl),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender's wallet address
    pub sender: String,
    /// Group the message belongs to, if any
    pub group_id: Option<String>,
    /// Private key of the message on the sender's side, used for dedup
    pub message_key: MessageKey,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl WireEnvelope {
    pub fn new(message: WireMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = bincode::deserialize(data)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}
