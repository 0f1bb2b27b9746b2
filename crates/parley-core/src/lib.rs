//! # parley-core
//!
//! Message delivery and payment reconciliation for the Parley wallet
//! client.
//!
//! - [`DeliveryPipeline`]: single-consumer FIFO queue for every message
//!   mutation, transmission over a [`SecureChannel`], offline queueing and
//!   group creation.
//! - [`PaymentReconciler`]: folds ledger status into stored payments and
//!   submits new payments through a [`Ledger`] and a [`Signer`].
//! - [`ConnectivityMonitor`]: online/offline level whose reconnect edges
//!   trigger retries.
//!
//! [`ParleyCore`] wires all of them around one database.

pub mod channel;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod reconciliation;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use channel::{RemoteIdentity, SecureChannel};
pub use client::{Boundaries, ParleyCore};
pub use config::CoreConfig;
pub use connectivity::{ConnectivityMonitor, ReconnectEdges};
pub use error::{ChannelError, CoreError, LedgerError, Result};
pub use ledger::{Ledger, SignedTransaction, Signer, UnsignedTransaction};
pub use pipeline::{DeliveryDeps, DeliveryPipeline};
pub use reconciliation::{
    LedgerEvent, ObservedPayment, PaymentNotification, PaymentReconciler, ReconcilerDeps,
};
pub use telemetry::init_tracing;
