//! Pending ledger transactions awaiting a terminal status.

use rusqlite::{params, OptionalExtension};

use parley_shared::MessageKey;

use crate::database::{json_from_sql, ts_from_sql, ts_to_sql, Database, SharedDatabase};
use crate::error::Result;
use crate::models::PendingTransaction;

impl Database {
    /// Insert or replace the entry for `tx.tx_hash`.
    pub fn save_pending_transaction(&self, tx: &PendingTransaction) -> Result<()> {
        self.conn().execute(
            "INSERT INTO pending_transactions (tx_hash, message_key, recipient, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tx_hash) DO UPDATE SET
                message_key = excluded.message_key,
                recipient = excluded.recipient",
            params![
                tx.tx_hash,
                tx.message_key.to_string(),
                serde_json::to_string(&tx.recipient)?,
                ts_to_sql(&tx.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_pending_transaction(&self, tx_hash: &str) -> Result<Option<PendingTransaction>> {
        let tx = self
            .conn()
            .query_row(
                "SELECT tx_hash, message_key, recipient, created_at
                 FROM pending_transactions WHERE tx_hash = ?1",
                params![tx_hash],
                row_to_pending_transaction,
            )
            .optional()?;
        Ok(tx)
    }

    /// All pending transactions, oldest first.
    pub fn list_pending_transactions(&self) -> Result<Vec<PendingTransaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT tx_hash, message_key, recipient, created_at
             FROM pending_transactions ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_pending_transaction)?;

        let mut txs = Vec::new();
        for row in rows {
            txs.push(row?);
        }
        Ok(txs)
    }

    pub fn remove_pending_transaction(&self, tx_hash: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM pending_transactions WHERE tx_hash = ?1",
            params![tx_hash],
        )?;
        Ok(affected > 0)
    }
}

/// Map a `rusqlite::Row` to a [`PendingTransaction`].
fn row_to_pending_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingTransaction> {
    let tx_hash: String = row.get(0)?;
    let key_str: String = row.get(1)?;
    let recipient_json: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    let message_key = MessageKey::parse(&key_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PendingTransaction {
        tx_hash,
        message_key,
        recipient: json_from_sql(2, &recipient_json)?,
        created_at: ts_from_sql(3, &created_str)?,
    })
}

/// Durable queue of submitted transactions keyed by hash.
#[derive(Clone)]
pub struct PendingTransactionStore {
    db: SharedDatabase,
}

impl PendingTransactionStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub fn save(&self, tx: &PendingTransaction) -> Result<()> {
        self.db.lock()?.save_pending_transaction(tx)?;
        tracing::debug!(tx_hash = %tx.tx_hash, msg_key = %tx.message_key, "pending transaction saved");
        Ok(())
    }

    pub fn get(&self, tx_hash: &str) -> Result<Option<PendingTransaction>> {
        self.db.lock()?.get_pending_transaction(tx_hash)
    }

    pub fn list(&self) -> Result<Vec<PendingTransaction>> {
        self.db.lock()?.list_pending_transactions()
    }

    pub fn remove(&self, tx_hash: &str) -> Result<bool> {
        let removed = self.db.lock()?.remove_pending_transaction(tx_hash)?;
        if removed {
            tracing::debug!(tx_hash, "pending transaction removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use parley_shared::Recipient;

    use super::*;

    fn store() -> (tempfile::TempDir, PendingTransactionStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, PendingTransactionStore::new(db.into_shared()))
    }

    fn pending(hash: &str) -> PendingTransaction {
        PendingTransaction {
            tx_hash: hash.to_string(),
            message_key: MessageKey::new(),
            recipient: Recipient::user("0xb0b"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_get_remove() {
        let (_dir, store) = store();
        let tx = pending("0xabc");

        store.save(&tx).unwrap();
        assert_eq!(store.get("0xabc").unwrap(), Some(tx.clone()));

        assert!(store.remove("0xabc").unwrap());
        assert!(store.get("0xabc").unwrap().is_none());
        assert!(!store.remove("0xabc").unwrap());
    }

    #[test]
    fn resave_keeps_single_entry() {
        let (_dir, store) = store();
        let tx = pending("0xabc");
        store.save(&tx).unwrap();
        store.save(&tx).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn list_is_oldest_first() {
        let (_dir, store) = store();
        let mut older = pending("0x01");
        older.created_at = Utc::now() - Duration::hours(1);
        let newer = pending("0x02");

        store.save(&newer).unwrap();
        store.save(&older).unwrap();

        let hashes: Vec<_> = store.list().unwrap().into_iter().map(|t| t.tx_hash).collect();
        assert_eq!(hashes, vec!["0x01", "0x02"]);
    }
}
