//! Wiring of the stores, the delivery pipeline and the reconciliation loop
//! around one database.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use parley_store::{
    ConversationStore, Database, PendingOutboxStore, PendingTransactionStore,
    TrustedIdentityStore,
};

use crate::channel::SecureChannel;
use crate::config::CoreConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::ledger::{Ledger, Signer};
use crate::pipeline::{DeliveryDeps, DeliveryPipeline};
use crate::reconciliation::{PaymentReconciler, ReconcilerDeps};

/// External services the core talks to.
pub struct Boundaries {
    pub channel: Arc<dyn SecureChannel>,
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<dyn Signer>,
    pub connectivity: ConnectivityMonitor,
}

/// A running core: stores plus the two background tasks.
pub struct ParleyCore {
    pub conversations: ConversationStore,
    pub outbox: PendingOutboxStore,
    pub transactions: PendingTransactionStore,
    pub identities: TrustedIdentityStore,
    pub pipeline: DeliveryPipeline,
    pub reconciler: PaymentReconciler,
    pub connectivity: ConnectivityMonitor,
    pipeline_task: JoinHandle<()>,
    reconciler_task: JoinHandle<()>,
}

impl ParleyCore {
    /// Open the database named by `config` and spawn the background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(config: &CoreConfig, boundaries: Boundaries) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::open_default()?,
        };
        Ok(Self::start_with(db, config, boundaries))
    }

    pub fn start_with(db: Database, config: &CoreConfig, boundaries: Boundaries) -> Self {
        let db = db.into_shared();
        let conversations = ConversationStore::new(db.clone(), config.event_capacity)
            .with_marker_gap(config.timestamp_gap);
        let outbox = PendingOutboxStore::new(db.clone());
        let transactions = PendingTransactionStore::new(db.clone());
        let identities = TrustedIdentityStore::new(db);

        let local_address = boundaries.signer.address();
        let (pipeline, pipeline_task) = DeliveryPipeline::spawn(DeliveryDeps {
            conversations: conversations.clone(),
            outbox: outbox.clone(),
            identities: identities.clone(),
            channel: boundaries.channel,
            connectivity: boundaries.connectivity.clone(),
            local_address: local_address.clone(),
        });
        let (reconciler, reconciler_task) = PaymentReconciler::spawn(ReconcilerDeps {
            conversations: conversations.clone(),
            transactions: transactions.clone(),
            pipeline: pipeline.clone(),
            ledger: boundaries.ledger,
            signer: boundaries.signer,
            connectivity: boundaries.connectivity.clone(),
            notify_failures: config.notify_payment_failures,
            event_capacity: config.event_capacity,
        });

        info!(address = %local_address, "parley core started");

        Self {
            conversations,
            outbox,
            transactions,
            identities,
            pipeline,
            reconciler,
            connectivity: boundaries.connectivity,
            pipeline_task,
            reconciler_task,
        }
    }

    /// Stop both workers after the work already queued and wait for them.
    pub async fn shutdown(self) {
        // The reconciler enqueues into the pipeline, so it goes first.
        let _ = self.reconciler.shutdown();
        let _ = self.reconciler_task.await;
        let _ = self.pipeline.shutdown();
        let _ = self.pipeline_task.await;
        info!("parley core stopped");
    }
}
