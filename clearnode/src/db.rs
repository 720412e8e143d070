//! The broker's durable store.
//!
//! A single SQLite connection behind a mutex. Every mutation the broker makes runs inside one SQL transaction, so a
//! failed request or event leaves no partial effects behind.

use std::{path::Path, str::FromStr};

use alloy::primitives::{Address, B256};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::*;

use crate::cfg::Amount;

#[derive(Debug)]
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Opens the database at `path`, or an in-memory database if no path is given.
    pub fn new<P>(path: Option<P>) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let conn = match path {
            Some(path) => {
                let path = path.as_ref();
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                info!(path = %path.display(), "opening database");
                Connection::open(path)
                    .with_context(|| format!("failed to open database at {}", path.display()))?
            }
            None => Connection::open_in_memory()?,
        };
        conn.pragma_update(None, "foreign_keys", true)?;
        Self::ensure_schema(&conn)?;
        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::new(None::<&Path>)
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                account_type TEXT NOT NULL,
                asset TEXT NOT NULL,
                wallet BLOB NOT NULL,
                credit TEXT NOT NULL,
                debit TEXT NOT NULL,
                session_key BLOB,
                created_at INTEGER NOT NULL);
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_account ON ledger_entries(account_id, account_type, asset);
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_wallet ON ledger_entries(wallet);
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_session_key ON ledger_entries(session_key, asset);
            CREATE TABLE IF NOT EXISTS ledger_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_type TEXT NOT NULL,
                from_account TEXT NOT NULL,
                from_account_type TEXT NOT NULL,
                to_account TEXT NOT NULL,
                to_account_type TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount TEXT NOT NULL,
                created_at INTEGER NOT NULL);
            CREATE INDEX IF NOT EXISTS idx_ledger_transactions_from ON ledger_transactions(from_account);
            CREATE INDEX IF NOT EXISTS idx_ledger_transactions_to ON ledger_transactions(to_account);
            CREATE TABLE IF NOT EXISTS session_keys (
                address BLOB NOT NULL PRIMARY KEY,
                wallet BLOB NOT NULL,
                application TEXT NOT NULL,
                scope TEXT NOT NULL,
                tag TEXT NOT NULL,
                allowances TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                registered_block INTEGER NOT NULL DEFAULT 0);
            CREATE INDEX IF NOT EXISTS idx_session_keys_wallet ON session_keys(wallet, application);
            CREATE TABLE IF NOT EXISTS wallets (
                address BLOB NOT NULL PRIMARY KEY,
                first_login INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS auth_challenges (
                challenge TEXT NOT NULL PRIMARY KEY,
                request TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0);
            CREATE TABLE IF NOT EXISTS channels (
                channel_id BLOB NOT NULL PRIMARY KEY,
                wallet BLOB NOT NULL,
                participant BLOB NOT NULL,
                token BLOB NOT NULL,
                asset TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                legacy INTEGER NOT NULL,
                challenge_expiry INTEGER NOT NULL,
                pending_resize TEXT,
                definition TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL);
            CREATE INDEX IF NOT EXISTS idx_channels_wallet ON channels(wallet);
            CREATE TABLE IF NOT EXISTS app_sessions (
                session_id BLOB NOT NULL PRIMARY KEY,
                definition TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                allocations TEXT NOT NULL,
                session_data TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS app_session_participants (
                session_id BLOB NOT NULL REFERENCES app_sessions (session_id),
                wallet BLOB NOT NULL,
                PRIMARY KEY (session_id, wallet));
            CREATE TABLE IF NOT EXISTS processed_events (
                tx_hash BLOB NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                PRIMARY KEY (tx_hash, log_index));
            CREATE TABLE IF NOT EXISTS sync_cursor (
                id INTEGER NOT NULL PRIMARY KEY CHECK (id = 0),
                block_number INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS rpc_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet BLOB NOT NULL,
                request_id INTEGER NOT NULL,
                method TEXT NOT NULL,
                params TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                request_sigs TEXT NOT NULL,
                response TEXT NOT NULL,
                response_sigs TEXT NOT NULL);
            CREATE INDEX IF NOT EXISTS idx_rpc_history_wallet ON rpc_history(wallet);",
        )?;
        Ok(())
    }

    /// Runs `f` inside a SQL transaction, committing only if it succeeds.
    pub fn with_transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Runs `f` against the connection outside of an explicit transaction. Only for reads.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn sync_cursor(&self) -> Result<Option<u64>> {
        self.read(sync_cursor)
    }

    pub fn set_sync_cursor(&self, block_number: u64) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO sync_cursor (id, block_number) VALUES (0, ?1)
                 ON CONFLICT (id) DO UPDATE SET block_number = excluded.block_number",
                [block_number],
            )?;
            Ok(())
        })
    }
}

/// The last block whose events have all been applied.
pub fn sync_cursor(conn: &Connection) -> Result<Option<u64>> {
    Ok(conn
        .query_row("SELECT block_number FROM sync_cursor WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()?)
}

/// Records that the event at `(tx_hash, log_index)` has been applied. Returns `false` if it already was.
pub fn mark_event_processed(
    tx: &Connection,
    tx_hash: B256,
    log_index: u64,
    block_number: u64,
) -> Result<bool> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO processed_events (tx_hash, log_index, block_number) VALUES (?1, ?2, ?3)",
        (HashSqlable(tx_hash), log_index, block_number),
    )?;
    Ok(inserted == 1)
}

/// Creates a thin wrapper for a type with proper From traits. To ease implementing To/FromSql on
/// foreign types.
macro_rules! make_wrapper {
    ($old: ty, $new: ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $new(pub $old);

        impl From<$old> for $new {
            fn from(value: $old) -> Self {
                Self(value)
            }
        }

        impl From<$new> for $old {
            fn from(value: $new) -> Self {
                value.0
            }
        }
    };
}

/// Stores a type as its JSON text.
macro_rules! sqlify_with_json {
    ($type: ty) => {
        impl rusqlite::types::ToSql for $type {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                let json = serde_json::to_string(self)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                Ok(rusqlite::types::ToSqlOutput::from(json))
            }
        }

        impl rusqlite::types::FromSql for $type {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                serde_json::from_str(value.as_str()?)
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}
pub(crate) use sqlify_with_json;

make_wrapper!(Address, AddressSqlable);
impl ToSql for AddressSqlable {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_slice()))
    }
}
impl FromSql for AddressSqlable {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(AddressSqlable(Address::from(<[u8; 20]>::column_result(
            value,
        )?)))
    }
}

make_wrapper!(B256, HashSqlable);
impl ToSql for HashSqlable {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_slice()))
    }
}
impl FromSql for HashSqlable {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(HashSqlable(B256::from(<[u8; 32]>::column_result(value)?)))
    }
}

// Amounts exceed SQLite's 64-bit integers, so they are stored as decimal text.
impl ToSql for Amount {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}
impl FromSql for Amount {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Amount::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Serializes `value` for a JSON column.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}
