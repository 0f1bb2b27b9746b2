//! Payment reconciliation loop.
//!
//! Runs in its own task, driven by commands (status pushes, observed
//! payments, payment submissions) and by reconnect edges.  There is no
//! steady-state timer.  Every change to a message goes through the delivery
//! pipeline; this loop only owns the pending-transaction bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use parley_shared::{MessageKey, Payload, Payment, PaymentStatus, Recipient, SendState, ThreadId};
use parley_store::{ConversationStore, Message, PendingTransaction, PendingTransactionStore};

use crate::connectivity::{ConnectivityMonitor, ReconnectEdges};
use crate::error::{CoreError, LedgerError, Result};
use crate::ledger::{Ledger, SignedTransaction, Signer};
use crate::pipeline::DeliveryPipeline;

/// Something the ledger told us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// Status pushed for a transaction hash.
    Status {
        tx_hash: String,
        status: PaymentStatus,
    },
    /// A transaction involving the local wallet, with full details.
    Observed(ObservedPayment),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedPayment {
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub status: PaymentStatus,
    pub observed_at: DateTime<Utc>,
}

/// User-visible payment problems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PaymentNotification {
    /// The payment never reached the ledger.
    Failed {
        message_key: MessageKey,
        thread_id: ThreadId,
        reason: String,
    },
    /// The ledger reported the transaction as errored.
    Rejected {
        message_key: MessageKey,
        tx_hash: String,
    },
}

enum ReconcileCommand {
    ReconcileAll,
    Event(LedgerEvent),
    ApplyStatus {
        tx_hash: String,
        status: PaymentStatus,
        reply: oneshot::Sender<Result<Message>>,
    },
    SendPayment {
        recipient: Recipient,
        message: Message,
    },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Collaborators injected into the reconciler.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub conversations: ConversationStore,
    pub transactions: PendingTransactionStore,
    pub pipeline: DeliveryPipeline,
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<dyn Signer>,
    pub connectivity: ConnectivityMonitor,
    /// Publish [`PaymentNotification`]s.
    pub notify_failures: bool,
    pub event_capacity: usize,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    tx: mpsc::UnboundedSender<ReconcileCommand>,
    notifications: broadcast::Sender<PaymentNotification>,
    pipeline: DeliveryPipeline,
    local_address: String,
}

impl PaymentReconciler {
    /// Spawn the loop.  A full reconciliation pass runs right away.
    pub fn spawn(deps: ReconcilerDeps) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(deps.event_capacity.max(1));

        let handle = Self {
            tx,
            notifications: notifications.clone(),
            pipeline: deps.pipeline.clone(),
            local_address: deps.signer.address(),
        };

        let edges = deps.connectivity.edges();
        let worker = ReconcileWorker {
            deps,
            notifications,
        };
        let join = tokio::spawn(worker.run(rx, edges));

        (handle, join)
    }

    /// Start a payment of `value` to a user.  The payment message is saved
    /// as `Sending` right away; submission to the ledger happens on the
    /// loop.  Returns the key of the payment message.
    pub fn send_payment(&self, recipient: Recipient, value: impl Into<String>) -> Result<MessageKey> {
        let to_address = match &recipient {
            Recipient::User { address, .. } => address.clone(),
            Recipient::Group(group) => {
                return Err(CoreError::InvalidRecipient(format!(
                    "cannot pay group {}",
                    group.id
                )))
            }
        };

        let message = Message::outgoing(
            self.local_address.clone(),
            Payload::Payment(Payment {
                tx_hash: None,
                from_address: self.local_address.clone(),
                to_address,
                value: value.into(),
                status: PaymentStatus::Unconfirmed,
            }),
        );
        let key = message.key;

        self.pipeline
            .save_as_sending(recipient.clone(), message.clone())?;
        self.enqueue(ReconcileCommand::SendPayment { recipient, message })?;
        Ok(key)
    }

    /// Feed an externally pushed ledger event.
    pub fn push(&self, event: LedgerEvent) -> Result<()> {
        self.enqueue(ReconcileCommand::Event(event))
    }

    /// Query the ledger for every unconfirmed pending transaction.
    pub fn reconcile(&self) -> Result<()> {
        self.enqueue(ReconcileCommand::ReconcileAll)
    }

    /// Apply a ledger status to the pending transaction `tx_hash`.
    pub async fn apply_status(&self, tx_hash: &str, status: PaymentStatus) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ReconcileCommand::ApplyStatus {
            tx_hash: tx_hash.to_string(),
            status,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::WorkerClosed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentNotification> {
        self.notifications.subscribe()
    }

    /// Wait until every command enqueued before this call has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ReconcileCommand::Flush(reply))?;
        rx.await.map_err(|_| CoreError::WorkerClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.enqueue(ReconcileCommand::Shutdown)
    }

    fn enqueue(&self, command: ReconcileCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| CoreError::WorkerClosed)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct ReconcileWorker {
    deps: ReconcilerDeps,
    notifications: broadcast::Sender<PaymentNotification>,
}

impl ReconcileWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ReconcileCommand>, mut edges: ReconnectEdges) {
        self.reconcile_all().await;

        let mut edges_open = true;
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(ReconcileCommand::Shutdown) | None => {
                        info!("reconciliation loop stopped");
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                online = edges.next(), if edges_open => {
                    if online {
                        debug!("connectivity regained, reconciling payments");
                        self.reconcile_all().await;
                    } else {
                        edges_open = false;
                    }
                }
            }
        }
    }

    async fn handle(&self, command: ReconcileCommand) {
        match command {
            ReconcileCommand::ReconcileAll => self.reconcile_all().await,
            ReconcileCommand::Event(LedgerEvent::Status { tx_hash, status }) => {
                if let Err(e) = self.apply_status(&tx_hash, status).await {
                    error!(tx_hash = %tx_hash, error = %e, "status push not applied");
                }
                self.reconcile_all().await;
            }
            ReconcileCommand::Event(LedgerEvent::Observed(payment)) => {
                if let Err(e) = self.observe(payment).await {
                    error!(error = %e, "failed to record observed payment");
                }
            }
            ReconcileCommand::ApplyStatus {
                tx_hash,
                status,
                reply,
            } => {
                let result = self.apply_status(&tx_hash, status).await;
                if let Err(e) = &result {
                    error!(tx_hash = %tx_hash, error = %e, "status not applied");
                }
                let _ = reply.send(result);
            }
            ReconcileCommand::SendPayment { recipient, message } => {
                if let Err(e) = self.submit_payment(recipient, message).await {
                    error!(error = %e, "payment submission aborted");
                }
            }
            ReconcileCommand::Flush(reply) => {
                let _ = reply.send(());
            }
            ReconcileCommand::Shutdown => {}
        }
    }

    /// Query the ledger for every pending transaction whose payment is
    /// still unconfirmed and fold the answers in.
    async fn reconcile_all(&self) {
        let pending = match self.deps.transactions.list() {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to list pending transactions");
                return;
            }
        };

        for tx in pending {
            let message = match self.deps.conversations.get_message(&tx.message_key) {
                Ok(message) => message,
                Err(e) => {
                    error!(tx_hash = %tx.tx_hash, error = %e, "failed to load payment message");
                    continue;
                }
            };

            let Some(status) = message
                .as_ref()
                .and_then(|m| m.payload.as_payment())
                .map(|p| p.status)
            else {
                error!(
                    tx_hash = %tx.tx_hash,
                    msg_key = %tx.message_key,
                    "pending transaction without payment message, dropping"
                );
                self.drop_pending(&tx.tx_hash);
                continue;
            };

            if status.is_terminal() {
                self.drop_pending(&tx.tx_hash);
                continue;
            }

            match self.deps.ledger.transaction_status(&tx.tx_hash).await {
                Ok(status) => {
                    if let Err(e) = self.apply_status(&tx.tx_hash, status).await {
                        error!(tx_hash = %tx.tx_hash, error = %e, "status not applied");
                    }
                }
                Err(e) => warn!(tx_hash = %tx.tx_hash, error = %e, "status query failed"),
            }
        }
    }

    fn drop_pending(&self, tx_hash: &str) {
        if let Err(e) = self.deps.transactions.remove(tx_hash) {
            error!(tx_hash, error = %e, "failed to remove pending transaction");
        }
    }

    async fn apply_status(&self, tx_hash: &str, status: PaymentStatus) -> Result<Message> {
        let pending = self
            .deps
            .transactions
            .get(tx_hash)?
            .ok_or_else(|| CoreError::UnknownTransaction(tx_hash.to_string()))?;

        let updated = match self
            .deps
            .pipeline
            .update_payment_status(pending.message_key, Some(tx_hash.to_string()), status)
            .await
        {
            Ok(updated) => updated,
            Err(e @ (CoreError::MessageNotFound(_) | CoreError::NotAPayment(_))) => {
                self.deps.transactions.remove(tx_hash)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if status.is_terminal() {
            self.deps.transactions.remove(tx_hash)?;
        } else {
            self.deps.transactions.save(&pending)?;
        }

        debug!(tx_hash, msg_key = %pending.message_key, ?status, "payment status applied");

        if status == PaymentStatus::Error {
            self.notify(PaymentNotification::Rejected {
                message_key: pending.message_key,
                tx_hash: tx_hash.to_string(),
            });
        }
        Ok(updated)
    }

    /// Record a payment seen on the ledger that this client may not know.
    async fn observe(&self, payment: ObservedPayment) -> Result<()> {
        if self.deps.transactions.get(&payment.tx_hash)?.is_some() {
            self.apply_status(&payment.tx_hash, payment.status).await?;
            return Ok(());
        }

        let local = self.deps.signer.address();
        let outgoing = payment.from_address == local;
        if !outgoing && payment.to_address != local {
            debug!(tx_hash = %payment.tx_hash, "observed payment does not involve us");
            return Ok(());
        }

        if self.deps.conversations.find_payment(&payment.tx_hash)?.is_some() {
            debug!(tx_hash = %payment.tx_hash, "observed payment already recorded");
            return Ok(());
        }

        let counterparty = if outgoing {
            &payment.to_address
        } else {
            &payment.from_address
        };
        let recipient = Recipient::user(counterparty.clone());

        let mut message = Message::outgoing(
            payment.from_address.clone(),
            Payload::Payment(Payment {
                tx_hash: Some(payment.tx_hash.clone()),
                from_address: payment.from_address.clone(),
                to_address: payment.to_address.clone(),
                value: payment.value.clone(),
                status: payment.status,
            }),
        );
        message.created_at = payment.observed_at;
        let key = message.key;

        let pipeline = &self.deps.pipeline;
        if outgoing {
            pipeline.save_as_sending(recipient.clone(), message.clone())?;
            pipeline.update_message(recipient.clone(), message.with_state(SendState::Sent))?;
        } else {
            pipeline.receive(recipient.clone(), message)?;
        }
        // The message must exist before a pending entry can point at it.
        pipeline.flush().await?;

        if !payment.status.is_terminal() {
            self.deps.transactions.save(&PendingTransaction {
                tx_hash: payment.tx_hash.clone(),
                message_key: key,
                recipient,
                created_at: Utc::now(),
            })?;
        }

        info!(tx_hash = %payment.tx_hash, msg_key = %key, outgoing, "recorded observed payment");
        Ok(())
    }

    /// Create, timestamp, sign and submit a payment already saved as
    /// `Sending`, then deliver the payment message to the payee.
    async fn submit_payment(&self, recipient: Recipient, message: Message) -> Result<()> {
        let Payload::Payment(mut payment) = message.payload.clone() else {
            return Err(CoreError::NotAPayment(message.key));
        };

        match self.submit(&payment).await {
            Ok(tx_hash) => {
                payment.tx_hash = Some(tx_hash.clone());
                let submitted = Message {
                    payload: Payload::Payment(payment),
                    ..message
                };
                let key = submitted.key;

                // Delivery to the payee settles the send state.
                self.deps.pipeline.send_only(recipient.clone(), submitted)?;
                self.deps.pipeline.flush().await?;
                self.deps.transactions.save(&PendingTransaction {
                    tx_hash: tx_hash.clone(),
                    message_key: key,
                    recipient,
                    created_at: Utc::now(),
                })?;

                info!(tx_hash = %tx_hash, msg_key = %key, "payment submitted");
            }
            Err(e) => {
                warn!(msg_key = %message.key, error = %e, "payment submission failed");
                let key = message.key;
                let thread_id = recipient.thread_id();
                self.deps
                    .pipeline
                    .update_message(recipient, message.with_state(SendState::Failed))?;
                self.notify(PaymentNotification::Failed {
                    message_key: key,
                    thread_id,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn submit(&self, payment: &Payment) -> std::result::Result<String, LedgerError> {
        let ledger = &self.deps.ledger;
        let unsigned = ledger
            .create_unsigned_transaction(&payment.from_address, &payment.to_address, &payment.value)
            .await?;
        let timestamp = ledger.timestamp().await?;
        let signed = SignedTransaction::sign(unsigned, timestamp, self.deps.signer.as_ref());
        ledger.submit_transaction(&signed).await
    }

    fn notify(&self, notification: PaymentNotification) {
        if self.deps.notify_failures {
            let _ = self.notifications.send(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_shared::identity::verify_signature;
    use parley_shared::protocol::WireMessage;
    use parley_shared::Identity;

    use super::*;
    use crate::error::ChannelError;
    use crate::pipeline::DeliveryDeps;
    use crate::testing::{stores, LogCapture, MockChannel, MockLedger, Stores};

    struct Harness {
        stores: Stores,
        channel: Arc<MockChannel>,
        ledger: Arc<MockLedger>,
        identity: Identity,
        connectivity: ConnectivityMonitor,
        pipeline: DeliveryPipeline,
        reconciler: PaymentReconciler,
    }

    async fn harness(online: bool) -> Harness {
        let stores = stores();
        let channel = MockChannel::new();
        let ledger = MockLedger::new();
        let identity = Identity::generate();
        let connectivity = ConnectivityMonitor::new(online);

        let (pipeline, _) = DeliveryPipeline::spawn(DeliveryDeps {
            conversations: stores.conversations.clone(),
            outbox: stores.outbox.clone(),
            identities: stores.identities.clone(),
            channel: channel.clone(),
            connectivity: connectivity.clone(),
            local_address: identity.address(),
        });
        let (reconciler, _) = PaymentReconciler::spawn(ReconcilerDeps {
            conversations: stores.conversations.clone(),
            transactions: stores.transactions.clone(),
            pipeline: pipeline.clone(),
            ledger: ledger.clone(),
            signer: Arc::new(identity.clone()),
            connectivity: connectivity.clone(),
            notify_failures: true,
            event_capacity: 16,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        reconciler.flush().await.unwrap();
        pipeline.flush().await.unwrap();

        Harness {
            stores,
            channel,
            ledger,
            identity,
            connectivity,
            pipeline,
            reconciler,
        }
    }

    impl Harness {
        async fn settle(&self) {
            self.reconciler.flush().await.unwrap();
            self.pipeline.flush().await.unwrap();
        }

        fn payment_of(&self, key: &MessageKey) -> (SendState, Payment) {
            let message = self.stores.conversations.get_message(key).unwrap().unwrap();
            (
                message.send_state,
                message.payload.as_payment().unwrap().clone(),
            )
        }
    }

    #[tokio::test]
    async fn unknown_status_creates_nothing() {
        let h = harness(true).await;
        let (logs, _guard) = LogCapture::install();

        h.reconciler
            .push(LedgerEvent::Status {
                tx_hash: "0xunknown".into(),
                status: PaymentStatus::Confirmed,
            })
            .unwrap();
        h.settle().await;

        assert!(h.stores.conversations.load_all().unwrap().is_empty());
        assert!(h.stores.transactions.list().unwrap().is_empty());
        let logs = logs.contents();
        assert!(logs.contains("status push not applied"), "{logs}");
        assert!(logs.contains("Unknown transaction: 0xunknown"), "{logs}");

        let err = h
            .reconciler
            .apply_status("0xunknown", PaymentStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownTransaction(hash) if hash == "0xunknown"));
    }

    #[tokio::test]
    async fn send_payment_submits_signed_transaction() {
        let h = harness(true).await;
        let bob = Recipient::user("0xb0b");

        let key = h.reconciler.send_payment(bob.clone(), "0x2a").unwrap();
        h.settle().await;

        let (state, payment) = h.payment_of(&key);
        assert_eq!(state, SendState::Sent);
        assert_eq!(payment.status, PaymentStatus::Unconfirmed);
        let tx_hash = payment.tx_hash.expect("hash recorded");

        let pending = h.stores.transactions.get(&tx_hash).unwrap().unwrap();
        assert_eq!(pending.message_key, key);
        assert_eq!(pending.recipient, bob);

        let submitted = h.ledger.submitted();
        assert_eq!(submitted.len(), 1);
        let tx = &submitted[0];
        assert_eq!(tx.unsigned.to_address, "0xb0b");
        assert_eq!(tx.unsigned.from_address, h.identity.address());
        let signed = SignedTransaction::signing_bytes(&tx.unsigned, tx.timestamp);
        assert!(verify_signature(&h.identity.public_key_bytes(), &signed, &tx.signature).is_ok());
    }

    #[tokio::test]
    async fn submitted_payment_is_delivered_to_payee() {
        let h = harness(true).await;

        let key = h
            .reconciler
            .send_payment(Recipient::user("0xb0b"), "0x2a")
            .unwrap();
        h.settle().await;

        let tx_hash = h.payment_of(&key).1.tx_hash.unwrap();
        let sent = h.channel.sent_to("0xb0b");
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            WireMessage::Chat(chat) => match &chat.payload {
                Payload::Payment(payment) => {
                    assert_eq!(payment.tx_hash.as_deref(), Some(tx_hash.as_str()));
                    assert_eq!(payment.value, "0x2a");
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.stores.outbox.fetch_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undeliverable_payment_keeps_pending_transaction() {
        let h = harness(true).await;
        h.channel
            .script("0xb0b", Err(ChannelError::Transport("peer unreachable".into())));

        let key = h
            .reconciler
            .send_payment(Recipient::user("0xb0b"), "0x1")
            .unwrap();
        h.settle().await;

        let (state, payment) = h.payment_of(&key);
        assert_eq!(state, SendState::Failed);
        let tx_hash = payment.tx_hash.unwrap();
        assert!(h.stores.transactions.get(&tx_hash).unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_submission_marks_failed_and_notifies() {
        let h = harness(true).await;
        let mut notifications = h.reconciler.subscribe();
        h.ledger
            .reject_submissions(LedgerError::Rejected("insufficient funds".into()));

        let key = h
            .reconciler
            .send_payment(Recipient::user("0xb0b"), "0xffff")
            .unwrap();
        h.settle().await;

        let (state, payment) = h.payment_of(&key);
        assert_eq!(state, SendState::Failed);
        assert!(payment.tx_hash.is_none());
        assert!(h.stores.transactions.list().unwrap().is_empty());

        match notifications.try_recv().unwrap() {
            PaymentNotification::Failed {
                message_key,
                thread_id,
                reason,
            } => {
                assert_eq!(message_key, key);
                assert_eq!(thread_id, ThreadId::from("0xb0b"));
                assert!(reason.contains("insufficient funds"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn paying_a_group_is_rejected() {
        let h = harness(true).await;
        let group = parley_shared::Group::new("g", vec!["0xa".into()]);
        assert!(matches!(
            h.reconciler.send_payment(Recipient::Group(group), "0x1"),
            Err(CoreError::InvalidRecipient(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_confirms_and_clears_pending() {
        let h = harness(true).await;
        let key = h
            .reconciler
            .send_payment(Recipient::user("0xb0b"), "0x1")
            .unwrap();
        h.settle().await;
        let tx_hash = h.payment_of(&key).1.tx_hash.unwrap();

        h.ledger.set_status(&tx_hash, PaymentStatus::Confirmed);
        h.reconciler.reconcile().unwrap();
        h.settle().await;

        let (state, payment) = h.payment_of(&key);
        assert_eq!(state, SendState::Sent);
        assert_eq!(payment.status, PaymentStatus::Confirmed);
        assert!(h.stores.transactions.get(&tx_hash).unwrap().is_none());
    }

    #[tokio::test]
    async fn unconfirmed_result_keeps_pending_entry() {
        let h = harness(true).await;
        let key = h
            .reconciler
            .send_payment(Recipient::user("0xb0b"), "0x1")
            .unwrap();
        h.settle().await;
        let tx_hash = h.payment_of(&key).1.tx_hash.unwrap();

        h.reconciler.reconcile().unwrap();
        h.settle().await;

        assert!(h.ledger.queried().contains(&tx_hash));
        assert!(h.stores.transactions.get(&tx_hash).unwrap().is_some());
        assert_eq!(h.payment_of(&key).1.status, PaymentStatus::Unconfirmed);
    }

    #[tokio::test]
    async fn ledger_error_notifies_rejection() {
        let h = harness(true).await;
        let mut notifications = h.reconciler.subscribe();
        let key = h
            .reconciler
            .send_payment(Recipient::user("0xb0b"), "0x1")
            .unwrap();
        h.settle().await;
        let tx_hash = h.payment_of(&key).1.tx_hash.unwrap();

        h.reconciler
            .push(LedgerEvent::Status {
                tx_hash: tx_hash.clone(),
                status: PaymentStatus::Error,
            })
            .unwrap();
        h.settle().await;

        assert_eq!(h.payment_of(&key).1.status, PaymentStatus::Error);
        assert!(h.stores.transactions.list().unwrap().is_empty());
        assert_eq!(
            notifications.try_recv().unwrap(),
            PaymentNotification::Rejected {
                message_key: key,
                tx_hash,
            }
        );
    }

    #[tokio::test]
    async fn observed_incoming_payment_creates_conversation() {
        let h = harness(true).await;

        h.reconciler
            .push(LedgerEvent::Observed(ObservedPayment {
                tx_hash: "0xin".into(),
                from_address: "0xa11ce".into(),
                to_address: h.identity.address(),
                value: "0x5".into(),
                status: PaymentStatus::Unconfirmed,
                observed_at: Utc::now(),
            }))
            .unwrap();
        h.settle().await;

        let conversations = h.stores.conversations.load_all().unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].thread_id, ThreadId::from("0xa11ce"));
        let message = conversations[0].latest_message.clone().unwrap();
        assert_eq!(message.send_state, SendState::Received);
        assert_eq!(message.sender, "0xa11ce");

        let pending = h.stores.transactions.get("0xin").unwrap().unwrap();
        assert_eq!(pending.message_key, message.key);
    }

    #[tokio::test]
    async fn observed_outgoing_confirmed_payment_is_sent_and_not_pending() {
        let h = harness(true).await;

        let observed = ObservedPayment {
            tx_hash: "0xout".into(),
            from_address: h.identity.address(),
            to_address: "0xb0b".into(),
            value: "0x9".into(),
            status: PaymentStatus::Confirmed,
            observed_at: Utc::now(),
        };
        h.reconciler
            .push(LedgerEvent::Observed(observed.clone()))
            .unwrap();
        h.reconciler.push(LedgerEvent::Observed(observed)).unwrap();
        h.settle().await;

        let conversations = h.stores.conversations.load_all().unwrap();
        assert_eq!(conversations.len(), 1);
        let payments: Vec<_> = conversations[0]
            .messages
            .iter()
            .filter(|m| m.payload.as_payment().is_some())
            .collect();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].send_state, SendState::Sent);
        assert!(h.stores.transactions.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn observed_payment_between_strangers_is_ignored() {
        let h = harness(true).await;

        h.reconciler
            .push(LedgerEvent::Observed(ObservedPayment {
                tx_hash: "0xother".into(),
                from_address: "0xa".into(),
                to_address: "0xb".into(),
                value: "0x1".into(),
                status: PaymentStatus::Confirmed,
                observed_at: Utc::now(),
            }))
            .unwrap();
        h.settle().await;

        assert!(h.stores.conversations.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_entry_without_message_is_dropped() {
        let h = harness(true).await;
        h.stores
            .transactions
            .save(&PendingTransaction {
                tx_hash: "0xorphan".into(),
                message_key: MessageKey::new(),
                recipient: Recipient::user("0xb0b"),
                created_at: Utc::now(),
            })
            .unwrap();

        h.reconciler.reconcile().unwrap();
        h.settle().await;

        assert!(h.stores.transactions.list().unwrap().is_empty());
        assert!(h.ledger.queried().is_empty());
        assert!(h.stores.conversations.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_triggers_reconciliation() {
        let h = harness(false).await;
        let bob = Recipient::user("0xb0b");

        let key = h.reconciler.send_payment(bob, "0x1").unwrap();
        h.settle().await;
        let tx_hash = h.payment_of(&key).1.tx_hash.unwrap();
        h.ledger.set_status(&tx_hash, PaymentStatus::Confirmed);

        h.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.settle().await;

        assert_eq!(h.payment_of(&key).1.status, PaymentStatus::Confirmed);
        assert!(h.stores.transactions.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn payload_update_after_send_keeps_sent() {
        let h = harness(true).await;
        let bob = Recipient::user("0xb0b");
        let key = h.reconciler.send_payment(bob, "0x1").unwrap();
        h.settle().await;
        let tx_hash = h.payment_of(&key).1.tx_hash.unwrap();

        let updated = h
            .reconciler
            .apply_status(&tx_hash, PaymentStatus::Confirmed)
            .await
            .unwrap();

        assert_eq!(updated.send_state, SendState::Sent);
        assert_eq!(h.payment_of(&key).0, SendState::Sent);
    }
}
