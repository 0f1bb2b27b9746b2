//! Boundaries to the ledger service and the local signer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_shared::{Identity, PaymentStatus};

use crate::error::LedgerError;

/// Transfer prepared by the ledger, ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    /// Bytes the signer must sign.
    pub signing_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub unsigned: UnsignedTransaction,
    /// Signature over [`SignedTransaction::signing_bytes`].
    pub signature: Vec<u8>,
    /// Ledger server time, covered by the signature.
    pub timestamp: DateTime<Utc>,
}

impl SignedTransaction {
    /// Fetch-then-sign input: the ledger's payload followed by the
    /// timestamp in big-endian epoch milliseconds.
    pub fn signing_bytes(unsigned: &UnsignedTransaction, timestamp: DateTime<Utc>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(unsigned.signing_payload.len() + 8);
        bytes.extend_from_slice(&unsigned.signing_payload);
        bytes.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
        bytes
    }

    /// Sign `unsigned` together with `timestamp`.
    pub fn sign(unsigned: UnsignedTransaction, timestamp: DateTime<Utc>, signer: &dyn Signer) -> Self {
        let signature = signer.sign(&Self::signing_bytes(&unsigned, timestamp));
        Self {
            unsigned,
            signature,
            timestamp,
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_unsigned_transaction(
        &self,
        from_address: &str,
        to_address: &str,
        value: &str,
    ) -> Result<UnsignedTransaction, LedgerError>;

    /// Submit a signed transaction, returning its hash.
    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError>;

    async fn transaction_status(&self, tx_hash: &str) -> Result<PaymentStatus, LedgerError>;

    async fn timestamp(&self) -> Result<DateTime<Utc>, LedgerError>;
}

/// Local, synchronous signing key.
pub trait Signer: Send + Sync {
    fn address(&self) -> String;

    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

impl Signer for Identity {
    fn address(&self) -> String {
        Identity::address(self)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        Identity::sign(self, payload).to_bytes().to_vec()
    }
}
