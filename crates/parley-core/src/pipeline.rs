//! Message delivery pipeline.
//!
//! Every outgoing and incoming message mutation is a [`DeliveryTask`] on one
//! unbounded mpsc queue drained by a single worker task, so effects are
//! applied strictly in enqueue order and at most one transmission is in
//! flight.  Callers enqueue and return; only group creation and payment
//! status updates wait for a reply.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use parley_shared::protocol::{ChatMessage, WireEnvelope, WireMessage};
use parley_shared::{Group, GroupControl, MessageKey, Payload, PaymentStatus, Recipient, SendState};
use parley_store::{
    Conversation, ConversationStore, Message, PendingOutboxStore, StoreError, TrustedIdentityStore,
};

use crate::channel::{RemoteIdentity, SecureChannel};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ChannelError, CoreError, Result};

/// Where a send request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    /// Re-submitted from the outbox after a reconnect.
    Outbox,
}

/// Work items processed by the delivery worker.
#[derive(Debug)]
enum DeliveryTask {
    SendAndSave {
        recipient: Recipient,
        message: Message,
        origin: Origin,
    },
    SendOnly {
        recipient: Recipient,
        message: Message,
    },
    SaveOnly {
        recipient: Recipient,
        message: Message,
    },
    SaveAsSending {
        recipient: Recipient,
        message: Message,
    },
    Update {
        recipient: Recipient,
        message: Message,
    },
    Receive {
        recipient: Recipient,
        message: Message,
    },
    /// Change the payment status (and hash) carried in a payload without
    /// touching the send state.
    UpdatePayment {
        key: MessageKey,
        tx_hash: Option<String>,
        status: PaymentStatus,
        reply: oneshot::Sender<Result<Message>>,
    },
    CreateGroup {
        group: Group,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    /// Re-enqueue every outbox entry behind the tasks already queued.
    ResendPending,
    /// Reply once every earlier task has been processed.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Collaborators injected into the pipeline.
#[derive(Clone)]
pub struct DeliveryDeps {
    pub conversations: ConversationStore,
    pub outbox: PendingOutboxStore,
    pub identities: TrustedIdentityStore,
    pub channel: Arc<dyn SecureChannel>,
    pub connectivity: ConnectivityMonitor,
    /// Wallet address of the local user.
    pub local_address: String,
}

/// Handle used to enqueue work.  Cheap to clone.
#[derive(Clone)]
pub struct DeliveryPipeline {
    tx: mpsc::UnboundedSender<DeliveryTask>,
}

impl DeliveryPipeline {
    /// Spawn the worker and the reconnect listener.
    ///
    /// If the device is already online, the outbox is flushed once right
    /// away.  Returns the handle and the worker's join handle.
    pub fn spawn(deps: DeliveryDeps) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Self { tx };

        let mut edges = deps.connectivity.edges();
        let online_at_start = deps.connectivity.is_online();

        let worker = DeliveryWorker {
            deps,
            queue: pipeline.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        let listener = pipeline.clone();
        tokio::spawn(async move {
            if online_at_start && listener.resend_pending().is_err() {
                return;
            }
            while edges.next().await {
                debug!("connectivity regained, flushing outbox");
                if listener.resend_pending().is_err() {
                    break;
                }
            }
        });

        (pipeline, handle)
    }

    /// Persist in `Sending`, then transmit.
    pub fn send_and_save(&self, recipient: Recipient, message: Message) -> Result<()> {
        self.enqueue(DeliveryTask::SendAndSave {
            recipient,
            message,
            origin: Origin::Caller,
        })
    }

    /// Transmit an already persisted message without saving it first.
    pub fn send_only(&self, recipient: Recipient, message: Message) -> Result<()> {
        self.enqueue(DeliveryTask::SendOnly { recipient, message })
    }

    /// Persist as `LocalOnly`; never transmitted.
    pub fn save_only(&self, recipient: Recipient, message: Message) -> Result<()> {
        self.enqueue(DeliveryTask::SaveOnly { recipient, message })
    }

    /// Persist as `Sending` without transmitting, e.g. while a payment is
    /// being submitted to the ledger.
    pub fn save_as_sending(&self, recipient: Recipient, message: Message) -> Result<()> {
        self.enqueue(DeliveryTask::SaveAsSending { recipient, message })
    }

    pub fn update_message(&self, recipient: Recipient, message: Message) -> Result<()> {
        self.enqueue(DeliveryTask::Update { recipient, message })
    }

    /// Persist a message received from `recipient` as `Received`.
    pub fn receive(&self, recipient: Recipient, message: Message) -> Result<()> {
        self.enqueue(DeliveryTask::Receive { recipient, message })
    }

    /// Re-submit every outbox entry through the queue.
    pub fn resend_pending(&self) -> Result<()> {
        self.enqueue(DeliveryTask::ResendPending)
    }

    /// Create a group: notify every member, then persist the conversation.
    /// Unlike the other operations this waits for the outcome.
    pub async fn create_group(&self, group: Group) -> Result<Conversation> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DeliveryTask::CreateGroup { group, reply })?;
        rx.await.map_err(|_| CoreError::WorkerClosed)?
    }

    pub(crate) async fn update_payment_status(
        &self,
        key: MessageKey,
        tx_hash: Option<String>,
        status: PaymentStatus,
    ) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DeliveryTask::UpdatePayment {
            key,
            tx_hash,
            status,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::WorkerClosed)?
    }

    /// Wait until every task enqueued before this call has been processed.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(DeliveryTask::Flush(reply))?;
        rx.await.map_err(|_| CoreError::WorkerClosed)
    }

    /// Stop the worker after the tasks already queued.
    pub fn shutdown(&self) -> Result<()> {
        self.enqueue(DeliveryTask::Shutdown)
    }

    fn enqueue(&self, task: DeliveryTask) -> Result<()> {
        self.tx.send(task).map_err(|_| CoreError::WorkerClosed)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct DeliveryWorker {
    deps: DeliveryDeps,
    queue: DeliveryPipeline,
}

/// Outcome of transmitting to every delivery address of a recipient.
enum Transmission {
    Delivered,
    /// At least one identity changed; the new keys have been pinned.
    /// `delivered` holds the addresses this attempt did reach.
    IdentityChanged { delivered: Vec<String> },
    Failed(ChannelError),
}

impl DeliveryWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<DeliveryTask>) {
        info!(address = %self.deps.local_address, "delivery worker started");

        while let Some(task) = rx.recv().await {
            match task {
                DeliveryTask::Shutdown => {
                    info!("delivery worker shutdown requested");
                    break;
                }
                task => self.handle(task).await,
            }
        }

        info!("delivery worker stopped");
    }

    async fn handle(&self, task: DeliveryTask) {
        match task {
            DeliveryTask::SendAndSave {
                recipient,
                message,
                origin: Origin::Caller,
            } => {
                let message = message.with_state(SendState::Sending);
                if let Err(e) = self
                    .deps
                    .conversations
                    .append_queued_message(&recipient, &message)
                {
                    error!(msg_key = %message.key, error = %e, "failed to persist message, dropping task");
                    return;
                }
                self.deliver(&recipient, message).await;
            }
            DeliveryTask::SendAndSave {
                recipient,
                message,
                origin: Origin::Outbox,
            } => self.retry(&recipient, message.key).await,
            DeliveryTask::SendOnly { recipient, message } => {
                if let Err(e) = self.deps.outbox.save(&recipient, &message) {
                    error!(msg_key = %message.key, error = %e, "failed to queue message, dropping task");
                    return;
                }
                self.deliver(&recipient, message.with_state(SendState::Sending))
                    .await;
            }
            DeliveryTask::SaveOnly { recipient, message } => {
                self.save(&recipient, message.with_state(SendState::LocalOnly));
            }
            DeliveryTask::SaveAsSending { recipient, message } => {
                self.save(&recipient, message.with_state(SendState::Sending));
            }
            DeliveryTask::Receive { recipient, message } => {
                self.save(&recipient, message.with_state(SendState::Received));
            }
            DeliveryTask::Update { recipient, message } => {
                match self.deps.conversations.update_message(&message) {
                    Ok(_) => {}
                    Err(StoreError::NotFound) => warn!(
                        msg_key = %message.key,
                        thread = %recipient.thread_id(),
                        "update for unknown message ignored"
                    ),
                    Err(e) => error!(msg_key = %message.key, error = %e, "failed to update message"),
                }
            }
            DeliveryTask::UpdatePayment {
                key,
                tx_hash,
                status,
                reply,
            } => {
                let result = self.update_payment(key, tx_hash, status);
                if let Err(e) = &result {
                    warn!(msg_key = %key, error = %e, "payment status not applied");
                }
                let _ = reply.send(result);
            }
            DeliveryTask::CreateGroup { group, reply } => {
                let result = self.create_group(group).await;
                let _ = reply.send(result);
            }
            DeliveryTask::ResendPending => self.requeue_outbox(),
            DeliveryTask::Flush(reply) => {
                let _ = reply.send(());
            }
            DeliveryTask::Shutdown => {}
        }
    }

    fn save(&self, recipient: &Recipient, message: Message) {
        if let Err(e) = self.deps.conversations.append_message(recipient, &message) {
            error!(msg_key = %message.key, state = %message.send_state, error = %e, "failed to save message");
        }
    }

    /// Transmit `message` (already in `Sending` and queued in the outbox)
    /// or leave it parked there as `Pending`.
    async fn deliver(&self, recipient: &Recipient, message: Message) {
        if let Err(e) = self.try_deliver(recipient, message.clone()).await {
            error!(msg_key = %message.key, error = %e, "delivery task aborted");
        }
    }

    async fn try_deliver(&self, recipient: &Recipient, message: Message) -> Result<()> {
        let key = message.key;

        if !self.deps.connectivity.is_online() {
            let message = message.with_state(SendState::Pending);
            self.deps
                .conversations
                .append_queued_message(recipient, &message)?;
            info!(msg_key = %key, thread = %recipient.thread_id(), "offline, message queued");
            return Ok(());
        }

        let bytes = WireEnvelope::new(WireMessage::Chat(ChatMessage {
            sender: message.sender.clone(),
            group_id: match recipient {
                Recipient::Group(group) => Some(group.id.clone()),
                Recipient::User { .. } => None,
            },
            message_key: key,
            payload: message.payload.clone(),
            created_at: message.created_at,
        }))
        .to_bytes()?;

        let state = match self.transmit(recipient, key, &bytes).await? {
            Transmission::Delivered => SendState::Sent,
            Transmission::IdentityChanged { delivered } => {
                // Leave the state alone and keep the message around for the
                // next flush, which skips the members already reached.
                self.deps
                    .conversations
                    .append_queued_message(recipient, &message)?;
                self.deps.outbox.mark_delivered(&key, &delivered)?;
                return Ok(());
            }
            Transmission::Failed(e) => {
                warn!(msg_key = %key, error = %e, "transmission failed");
                SendState::Failed
            }
        };

        let message = message.with_state(state);
        self.deps.conversations.append_message(recipient, &message)?;
        self.deps.outbox.remove(&key)?;
        debug!(msg_key = %key, state = %state, "delivery attempt finished");
        Ok(())
    }

    /// Send `bytes` to every delivery address of `recipient` that an earlier
    /// attempt for `key` has not reached yet.
    async fn transmit(
        &self,
        recipient: &Recipient,
        key: MessageKey,
        bytes: &[u8],
    ) -> Result<Transmission> {
        let reached = self.deps.outbox.delivered_to(&key)?;
        let addresses: Vec<String> = recipient
            .delivery_addresses(&self.deps.local_address)
            .into_iter()
            .filter(|address| !reached.contains(address))
            .collect();
        if !reached.is_empty() {
            debug!(msg_key = %key, skipped = reached.len(), "members already reached skipped");
        }
        let results = self.send_to_all(&addresses, bytes).await?;

        let mut identity_changed = false;
        let mut failure = None;
        let mut delivered = Vec::new();
        for (address, result) in addresses.into_iter().zip(results) {
            match result {
                Ok(()) => delivered.push(address),
                Err(ChannelError::UntrustedIdentity {
                    address,
                    identity_key,
                }) => {
                    warn!(
                        address = %address,
                        identity_key = %hex::encode(identity_key),
                        "remote identity changed, pinning new key"
                    );
                    self.deps.identities.trust(&address, &identity_key)?;
                    identity_changed = true;
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        Ok(match (failure, identity_changed) {
            (Some(e), _) => Transmission::Failed(e),
            (None, true) => Transmission::IdentityChanged { delivered },
            (None, false) => Transmission::Delivered,
        })
    }

    async fn send_to_all(
        &self,
        addresses: &[String],
        bytes: &[u8],
    ) -> Result<Vec<std::result::Result<(), ChannelError>>> {
        let mut remotes = Vec::with_capacity(addresses.len());
        for address in addresses {
            let trusted_key = self
                .deps
                .identities
                .get(address)?
                .map(|pinned| pinned.identity_key);
            remotes.push(RemoteIdentity {
                address: address.clone(),
                trusted_key,
            });
        }

        let channel = &self.deps.channel;
        Ok(join_all(remotes.iter().map(|remote| channel.send(remote, bytes))).await)
    }

    /// Retry an outbox entry against the current stored state.
    async fn retry(&self, recipient: &Recipient, key: MessageKey) {
        match self.deps.outbox.contains(&key) {
            Ok(true) => {}
            Ok(false) => {
                debug!(msg_key = %key, "outbox entry already resolved");
                return;
            }
            Err(e) => {
                error!(msg_key = %key, error = %e, "failed to read outbox");
                return;
            }
        }

        let current = match self.deps.conversations.get_message(&key) {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!(msg_key = %key, "queued message vanished, dropping outbox entry");
                self.drop_outbox_entry(&key);
                return;
            }
            Err(e) => {
                error!(msg_key = %key, error = %e, "failed to load queued message");
                return;
            }
        };

        if current.send_state.is_terminal() {
            debug!(msg_key = %key, state = %current.send_state, "queued message already resolved");
            self.drop_outbox_entry(&key);
            return;
        }

        let message = current.with_state(SendState::Sending);
        if let Err(e) = self.deps.conversations.update_message(&message) {
            error!(msg_key = %key, error = %e, "failed to mark message as sending");
            return;
        }
        self.deliver(recipient, message).await;
    }

    fn drop_outbox_entry(&self, key: &MessageKey) {
        if let Err(e) = self.deps.outbox.remove(key) {
            error!(msg_key = %key, error = %e, "failed to remove outbox entry");
        }
    }

    fn requeue_outbox(&self) {
        let entries = match self.deps.outbox.fetch_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to read outbox");
                return;
            }
        };

        if !entries.is_empty() {
            info!(count = entries.len(), "re-submitting queued messages");
        }

        for (recipient, message) in entries {
            if self
                .queue
                .enqueue(DeliveryTask::SendAndSave {
                    recipient,
                    message,
                    origin: Origin::Outbox,
                })
                .is_err()
            {
                break;
            }
        }
    }

    fn update_payment(
        &self,
        key: MessageKey,
        tx_hash: Option<String>,
        status: PaymentStatus,
    ) -> Result<Message> {
        let current = self
            .deps
            .conversations
            .get_message(&key)?
            .ok_or(CoreError::MessageNotFound(key))?;

        let Payload::Payment(mut payment) = current.payload.clone() else {
            return Err(CoreError::NotAPayment(key));
        };
        payment.status = status;
        if tx_hash.is_some() {
            payment.tx_hash = tx_hash;
        }

        let updated = Message {
            payload: Payload::Payment(payment),
            ..current
        };
        self.deps.conversations.update_message(&updated)?;
        Ok(updated)
    }

    async fn create_group(&self, group: Group) -> Result<Conversation> {
        let recipient = Recipient::Group(group.clone());
        let members = recipient.delivery_addresses(&self.deps.local_address);
        if members.is_empty() {
            return Err(CoreError::EmptyGroup { group_id: group.id });
        }
        if !self.deps.connectivity.is_online() {
            return Err(CoreError::Offline);
        }

        let control = GroupControl::Create(group.clone());
        let bytes = WireEnvelope::new(WireMessage::GroupControl(control.clone())).to_bytes()?;

        let results = self.send_to_all(&members, &bytes).await?;
        let total = results.len();
        let mut failed = 0;
        let mut reason = None;
        for result in results {
            if let Err(e) = result {
                if let ChannelError::UntrustedIdentity {
                    address,
                    identity_key,
                } = &e
                {
                    self.deps.identities.trust(address, identity_key)?;
                }
                failed += 1;
                reason.get_or_insert_with(|| e.to_string());
            }
        }

        if let Some(reason) = reason {
            warn!(group_id = %group.id, failed, total, "group creation failed");
            return Err(CoreError::GroupDelivery {
                failed,
                total,
                reason,
            });
        }

        self.deps.conversations.upsert_conversation(&recipient)?;
        let record = Message::outgoing(self.deps.local_address.clone(), Payload::GroupControl(control))
            .with_state(SendState::LocalOnly);
        let conversation = self.deps.conversations.append_message(&recipient, &record)?;

        info!(group_id = %group.id, members = total, "group created");
        Ok(conversation)
    }
}
