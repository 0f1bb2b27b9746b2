use thiserror::Error;

use parley_shared::{MessageKey, ProtocolError};
use parley_store::StoreError;

/// Failure reported by a [`SecureChannel`](crate::channel::SecureChannel).
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The remote side presented an identity key other than the pinned one.
    #[error("Untrusted identity for {address}")]
    UntrustedIdentity {
        address: String,
        identity_key: [u8; 32],
    },

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Failure reported by a [`Ledger`](crate::ledger::Ledger).
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("Ledger unreachable: {0}")]
    Unreachable(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageKey),

    #[error("Message {0} is not a payment")]
    NotAPayment(MessageKey),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Group {group_id} has no remote members")]
    EmptyGroup { group_id: String },

    #[error("Delivery to {failed} of {total} group members failed: {reason}")]
    GroupDelivery {
        failed: usize,
        total: usize,
        reason: String,
    },

    #[error("Device is offline")]
    Offline,

    #[error("Worker is no longer running")]
    WorkerClosed,
}

pub type Result<T> = std::result::Result<T, CoreError>;
