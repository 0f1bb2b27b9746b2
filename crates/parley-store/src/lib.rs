//! # parley-store
//!
//! Durable local state for the Parley delivery core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle with typed CRUD
//! helpers, and three stores built on a shared handle:
//!
//! - [`ConversationStore`]: conversations and their ordered messages, the
//!   single source of truth for message state, with change notifications.
//! - [`PendingOutboxStore`]: messages waiting for connectivity.
//! - [`PendingTransactionStore`]: ledger transactions awaiting confirmation.
//!
//! Every mutation runs inside one SQLite transaction while holding the
//! shared handle's lock, so there is exactly one writer at a time and no
//! reader can observe a partial write.

pub mod conversation_store;
pub mod conversations;
pub mod database;
pub mod identities;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod transactions;

mod error;

pub use conversation_store::{ConversationChange, ConversationStore, ThreadEvent, ThreadWatch};
pub use conversations::AppendOutcome;
pub use database::{Database, SharedDatabase};
pub use error::{Result, StoreError};
pub use identities::TrustedIdentityStore;
pub use models::*;
pub use outbox::PendingOutboxStore;
pub use transactions::PendingTransactionStore;
