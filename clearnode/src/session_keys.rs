//! Delegated signing keys.
//!
//! A wallet registers a session key through the auth handshake. The key may then sign requests on the wallet's
//! behalf, limited to its application and to per-asset spending allowances. Spending is never stored separately: it is
//! the sum of the ledger debits tagged with the key.

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    cfg::{Amount, AuthConfig},
    db::{self, AddressSqlable, from_json, to_json},
    error::RpcError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeTag {
    /// May act for any application and is not subject to allowances.
    Root,
    Application,
}

impl ScopeTag {
    fn as_str(&self) -> &'static str {
        match self {
            ScopeTag::Root => "root",
            ScopeTag::Application => "application",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "root" => Ok(ScopeTag::Root),
            "application" => Ok(ScopeTag::Application),
            other => Err(anyhow!("unknown scope tag {other}")),
        }
    }
}

pub fn scope_tag(config: &AuthConfig, scope: &str) -> ScopeTag {
    if config.root_scopes.iter().any(|s| s == scope) {
        ScopeTag::Root
    } else {
        ScopeTag::Application
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub asset: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub address: Address,
    pub wallet: Address,
    pub application: String,
    pub scope: String,
    pub tag: ScopeTag,
    pub allowances: Vec<Allowance>,
    pub expires_at: u64,
    pub created_at: u64,
    pub revoked: bool,
    /// The sync cursor when the key was first registered. Channels created up to this block predate the key.
    pub registered_block: u64,
}

impl SessionKey {
    pub fn is_root(&self) -> bool {
        self.tag == ScopeTag::Root
    }

    pub fn is_active(&self, now: u64) -> bool {
        !self.revoked && now < self.expires_at
    }

    /// The allowance for `asset`. Assets which are not listed may not be spent at all.
    pub fn allowance(&self, asset: &str) -> Amount {
        self.allowances
            .iter()
            .find(|a| a.asset == asset)
            .map(|a| a.amount)
            .unwrap_or(Amount::ZERO)
    }

    pub fn may_act_for(&self, application: &str) -> bool {
        self.is_root() || self.application == application
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let tag: String = row.get(4)?;
        let allowances: String = row.get(5)?;
        let to_sql_error = |e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        };
        Ok(SessionKey {
            address: row.get::<_, AddressSqlable>(0)?.into(),
            wallet: row.get::<_, AddressSqlable>(1)?.into(),
            application: row.get(2)?,
            scope: row.get(3)?,
            tag: ScopeTag::parse(&tag).map_err(to_sql_error)?,
            allowances: from_json(&allowances).map_err(to_sql_error)?,
            expires_at: row.get(6)?,
            created_at: row.get(7)?,
            revoked: row.get(8)?,
            registered_block: row.get(9)?,
        })
    }
}

/// Who signed a request: the wallet itself, or one of its active session keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signer {
    Wallet(Address),
    SessionKey(SessionKey),
}

impl Signer {
    /// The wallet the signer acts for.
    pub fn wallet(&self) -> Address {
        match self {
            Signer::Wallet(address) => *address,
            Signer::SessionKey(key) => key.wallet,
        }
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        match self {
            Signer::Wallet(_) => None,
            Signer::SessionKey(key) => Some(key),
        }
    }

    /// Whether the signer may act within `application`.
    pub fn may_act_for(&self, application: &str) -> bool {
        self.session_key()
            .is_none_or(|key| key.may_act_for(application))
    }
}

const SELECT_KEY: &str = "SELECT address, wallet, application, scope, tag, allowances, expires_at, created_at, revoked,
    registered_block FROM session_keys";

pub fn get(conn: &Connection, address: Address) -> Result<Option<SessionKey>> {
    Ok(conn
        .query_row(
            &format!("{SELECT_KEY} WHERE address = ?1"),
            [AddressSqlable(address)],
            SessionKey::from_row,
        )
        .optional()?)
}

/// The session keys of `wallet`, newest first. Expired and revoked keys are only included if `include_inactive`.
pub fn list(
    conn: &Connection,
    wallet: Address,
    now: u64,
    include_inactive: bool,
) -> Result<Vec<SessionKey>> {
    let mut statement =
        conn.prepare_cached(&format!("{SELECT_KEY} WHERE wallet = ?1 ORDER BY created_at DESC, address"))?;
    let keys = statement
        .query_map([AddressSqlable(wallet)], SessionKey::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys
        .into_iter()
        .filter(|key| include_inactive || key.is_active(now))
        .collect())
}

/// Whether `address` has acted as a wallet of its own: logged in as one, held funds or owned channels or keys.
pub fn is_wallet(conn: &Connection, address: Address) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM wallets WHERE address = ?1)
            OR EXISTS (SELECT 1 FROM ledger_entries WHERE wallet = ?1)
            OR EXISTS (SELECT 1 FROM channels WHERE wallet = ?1)
            OR EXISTS (SELECT 1 FROM session_keys WHERE wallet = ?1)",
        [AddressSqlable(address)],
        |row| row.get(0),
    )?)
}

/// Remembers that `address` logged in as a wallet.
pub fn record_wallet(conn: &Connection, address: Address, now: u64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO wallets (address, first_login) VALUES (?1, ?2)",
        params![AddressSqlable(address), now],
    )?;
    Ok(())
}

/// Maps the signer of a request to the wallet it acts for.
pub fn resolve_signer(conn: &Connection, address: Address, now: u64) -> Result<Signer, RpcError> {
    match get(conn, address)? {
        Some(key) if key.is_active(now) => Ok(Signer::SessionKey(key)),
        Some(key) => Err(RpcError::authentication(format!(
            "session key {} is expired or revoked",
            key.address
        ))),
        None => Ok(Signer::Wallet(address)),
    }
}

/// Registers `key`, or refreshes the policy of a key that is already registered and active. A refresh never moves
/// the expiry. Any other key of the same wallet and application is revoked. Returns the key as stored.
pub fn register(conn: &Connection, key: &SessionKey, now: u64) -> Result<SessionKey, RpcError> {
    if key.address == key.wallet {
        return Err(RpcError::validation("a wallet cannot be its own session key"));
    }
    match get(conn, key.address)? {
        Some(existing) if existing.wallet != key.wallet => {
            return Err(RpcError::authentication(
                "session key is registered to another wallet",
            ));
        }
        Some(existing) if !existing.is_active(now) => {
            return Err(RpcError::authentication(
                "session key is expired or revoked and cannot be registered again",
            ));
        }
        Some(_) => {}
        None => {
            if is_wallet(conn, key.address)? {
                return Err(RpcError::authentication(format!(
                    "{} acts as a wallet and cannot be a session key",
                    key.address
                )));
            }
        }
    }
    let superseded = conn.execute(
        "UPDATE session_keys SET revoked = 1
         WHERE wallet = ?1 AND application = ?2 AND address != ?3 AND revoked = 0",
        params![
            AddressSqlable(key.wallet),
            key.application,
            AddressSqlable(key.address)
        ],
    )?;
    conn.execute(
        "INSERT INTO session_keys (address, wallet, application, scope, tag, allowances, expires_at, created_at, revoked,
            registered_block)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
         ON CONFLICT (address) DO UPDATE SET application = excluded.application, scope = excluded.scope,
            tag = excluded.tag, allowances = excluded.allowances",
        params![
            AddressSqlable(key.address),
            AddressSqlable(key.wallet),
            key.application,
            key.scope,
            key.tag.as_str(),
            to_json(&key.allowances)?,
            key.expires_at,
            key.created_at,
            db::sync_cursor(conn)?.unwrap_or_default(),
        ],
    )?;
    info!(
        session_key = %key.address,
        wallet = %key.wallet,
        application = %key.application,
        superseded,
        "session key registered"
    );
    get(conn, key.address)?.ok_or_else(|| RpcError::Internal(anyhow!("session key {} vanished", key.address)))
}

/// The total `asset` debited from ledger accounts under `key`.
pub fn used(conn: &Connection, key: Address, asset: &str) -> Result<Amount> {
    let mut statement = conn.prepare_cached(
        "SELECT debit FROM ledger_entries WHERE session_key = ?1 AND asset = ?2",
    )?;
    let debits = statement.query_map(params![AddressSqlable(key), asset], |row| {
        row.get::<_, Amount>(0)
    })?;
    let mut total = Amount::ZERO;
    for debit in debits {
        total = total
            .checked_add(debit?)
            .ok_or_else(|| anyhow!("spending overflow for session key {key}"))?;
    }
    Ok(total)
}

/// Checks that `key` may spend a further `amount` of `asset`.
pub fn check_allowance(
    conn: &Connection,
    key: &SessionKey,
    asset: &str,
    amount: Amount,
) -> Result<(), RpcError> {
    if key.is_root() {
        return Ok(());
    }
    let allowance = key.allowance(asset);
    let used = used(conn, key.address, asset)?;
    match used.checked_add(amount) {
        Some(total) if total <= allowance => Ok(()),
        _ => Err(RpcError::AllowanceExceeded {
            asset: asset.to_owned(),
            used,
            allowance,
            requested: amount,
        }),
    }
}

/// The spending of `key` against each of its allowances.
pub fn usage(conn: &Connection, key: &SessionKey) -> Result<Vec<(Allowance, Amount)>> {
    key.allowances
        .iter()
        .map(|allowance| {
            let used = used(conn, key.address, &allowance.asset)?;
            Ok((allowance.clone(), used))
        })
        .collect()
}

/// Revokes `target` on behalf of `actor`.
///
/// A wallet may revoke any of its keys and a key may revoke itself. Only a root key may revoke the other keys of its
/// wallet.
pub fn revoke(
    conn: &Connection,
    actor: &Signer,
    target: Address,
    now: u64,
) -> Result<SessionKey, RpcError> {
    let key = get(conn, target)?
        .ok_or_else(|| RpcError::not_found(format!("session key {target}")))?;
    let permitted = match actor {
        Signer::Wallet(wallet) => key.wallet == *wallet,
        Signer::SessionKey(own) => {
            own.address == key.address || (own.is_root() && own.wallet == key.wallet)
        }
    };
    if !permitted {
        return Err(RpcError::authentication(format!(
            "not permitted to revoke session key {target}"
        )));
    }
    if !key.is_active(now) {
        return Err(RpcError::validation(format!(
            "session key {target} is already inactive"
        )));
    }
    conn.execute(
        "UPDATE session_keys SET revoked = 1 WHERE address = ?1",
        [AddressSqlable(target)],
    )?;
    info!(session_key = %target, wallet = %key.wallet, "session key revoked");
    Ok(SessionKey {
        revoked: true,
        ..key
    })
}
