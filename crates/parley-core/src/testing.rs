//! In-memory boundaries and fixtures shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use parley_shared::protocol::{WireEnvelope, WireMessage};
use parley_shared::PaymentStatus;
use parley_store::{
    ConversationStore, Database, PendingOutboxStore, PendingTransactionStore,
    TrustedIdentityStore,
};

use crate::channel::{RemoteIdentity, SecureChannel};
use crate::error::{ChannelError, LedgerError};
use crate::ledger::{Ledger, SignedTransaction, UnsignedTransaction};

pub const LOCAL_ADDRESS: &str = "0xme";

/// Every store on one temporary database.
pub struct Stores {
    pub conversations: ConversationStore,
    pub outbox: PendingOutboxStore,
    pub transactions: PendingTransactionStore,
    pub identities: TrustedIdentityStore,
    _dir: TempDir,
}

pub fn stores() -> Stores {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_at(&dir.path().join("parley.db"))
        .unwrap()
        .into_shared();
    Stores {
        conversations: ConversationStore::new(db.clone(), 64),
        outbox: PendingOutboxStore::new(db.clone()),
        transactions: PendingTransactionStore::new(db.clone()),
        identities: TrustedIdentityStore::new(db),
        _dir: dir,
    }
}

/// Records every send; replies with scripted results per address, or `Ok`.
#[derive(Default)]
pub struct MockChannel {
    sent: Mutex<Vec<(RemoteIdentity, Vec<u8>)>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<(), ChannelError>>>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the result of the next send to `address`.
    pub fn script(&self, address: &str, result: Result<(), ChannelError>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn sent(&self) -> Vec<(RemoteIdentity, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<WireMessage> {
        self.sent()
            .into_iter()
            .filter(|(remote, _)| remote.address == address)
            .map(|(_, bytes)| WireEnvelope::from_bytes(&bytes).unwrap().message)
            .collect()
    }
}

#[async_trait]
impl SecureChannel for MockChannel {
    async fn send(&self, recipient: &RemoteIdentity, payload: &[u8]) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.clone(), payload.to_vec()));
        self.scripted
            .lock()
            .unwrap()
            .get_mut(&recipient.address)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()))
    }
}

/// Ledger keeping statuses in a map.
#[derive(Default)]
pub struct MockLedger {
    statuses: Mutex<HashMap<String, PaymentStatus>>,
    submitted: Mutex<Vec<SignedTransaction>>,
    queried: Mutex<Vec<String>>,
    reject_submissions: Mutex<Option<LedgerError>>,
    next_hash: AtomicU64,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, tx_hash: &str, status: PaymentStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), status);
    }

    pub fn reject_submissions(&self, error: LedgerError) {
        *self.reject_submissions.lock().unwrap() = Some(error);
    }

    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn create_unsigned_transaction(
        &self,
        from_address: &str,
        to_address: &str,
        value: &str,
    ) -> Result<UnsignedTransaction, LedgerError> {
        Ok(UnsignedTransaction {
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
            value: value.to_string(),
            signing_payload: format!("{from_address}:{to_address}:{value}").into_bytes(),
        })
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError> {
        if let Some(error) = self.reject_submissions.lock().unwrap().clone() {
            return Err(error);
        }
        let n = self.next_hash.fetch_add(1, Ordering::SeqCst);
        let hash = format!("0x{n:064x}");
        self.submitted.lock().unwrap().push(tx.clone());
        self.set_status(&hash, PaymentStatus::Unconfirmed);
        Ok(hash)
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<PaymentStatus, LedgerError> {
        self.queried.lock().unwrap().push(tx_hash.to_string());
        self.statuses
            .lock()
            .unwrap()
            .get(tx_hash)
            .copied()
            .ok_or_else(|| LedgerError::Unreachable(format!("no status for {tx_hash}")))
    }

    async fn timestamp(&self) -> Result<DateTime<Utc>, LedgerError> {
        Ok(Utc::now())
    }
}

/// `io::Write` sink collecting formatted log lines.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Install a capturing subscriber for the current thread until the
    /// returned guard drops.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
