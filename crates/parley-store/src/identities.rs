//! Pinned identity keys of remote addresses.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{ts_from_sql, ts_to_sql, Database, SharedDatabase};
use crate::error::Result;
use crate::models::TrustedIdentity;

impl Database {
    /// Pin `identity_key` for `address`, replacing any previous pin.
    pub fn trust_identity(&self, address: &str, identity_key: &[u8; 32]) -> Result<TrustedIdentity> {
        let trusted_at = Utc::now();
        self.conn().execute(
            "INSERT INTO trusted_identities (address, identity_key, trusted_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET
                identity_key = excluded.identity_key,
                trusted_at = excluded.trusted_at",
            params![address, hex::encode(identity_key), ts_to_sql(&trusted_at)],
        )?;
        Ok(TrustedIdentity {
            address: address.to_string(),
            identity_key: *identity_key,
            trusted_at,
        })
    }

    pub fn get_trusted_identity(&self, address: &str) -> Result<Option<TrustedIdentity>> {
        let identity = self
            .conn()
            .query_row(
                "SELECT address, identity_key, trusted_at FROM trusted_identities WHERE address = ?1",
                params![address],
                row_to_trusted_identity,
            )
            .optional()?;
        Ok(identity)
    }
}

/// Map a `rusqlite::Row` to a [`TrustedIdentity`].
fn row_to_trusted_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrustedIdentity> {
    let address: String = row.get(0)?;
    let key_hex: String = row.get(1)?;
    let trusted_str: String = row.get(2)?;

    let bytes = hex::decode(&key_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let identity_key: [u8; 32] = bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            "identity key is not 32 bytes".into(),
        )
    })?;

    Ok(TrustedIdentity {
        address,
        identity_key,
        trusted_at: ts_from_sql(2, &trusted_str)?,
    })
}

/// Key pins consulted before every transmission.
#[derive(Clone)]
pub struct TrustedIdentityStore {
    db: SharedDatabase,
}

impl TrustedIdentityStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub fn trust(&self, address: &str, identity_key: &[u8; 32]) -> Result<TrustedIdentity> {
        let pinned = self.db.lock()?.trust_identity(address, identity_key)?;
        tracing::info!(
            address,
            identity_key = %hex::encode(identity_key),
            "pinned new identity key"
        );
        Ok(pinned)
    }

    pub fn get(&self, address: &str) -> Result<Option<TrustedIdentity>> {
        self.db.lock()?.get_trusted_identity(address)
    }
}
