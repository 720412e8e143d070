//! Double-entry accounting over append-only ledger rows.
//!
//! Balances are never stored. They are the sum of credits minus the sum of debits of an account, and no debit is ever
//! written that would take an account below zero.

use std::{collections::BTreeMap, fmt, str::FromStr};

use alloy::primitives::{Address, B256};
use anyhow::{Result, anyhow};
use rusqlite::{
    Connection, Row, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    cfg::Amount,
    db::AddressSqlable,
    error::RpcError,
    session_keys::{self, SessionKey},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// A participant's unified off-chain balance.
    Wallet,
    /// Mirror of an account's available balance in the custody.
    Custody,
    /// Funds reserved for a channel while a signed resize or close awaits confirmation.
    Escrow,
    AppSession,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Wallet => "wallet",
            AccountType::Custody => "custody",
            AccountType::Escrow => "escrow",
            AccountType::AppSession => "app_session",
        }
    }
}

impl FromStr for AccountType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "wallet" => AccountType::Wallet,
            "custody" => AccountType::Custody,
            "escrow" => AccountType::Escrow,
            "app_session" => AccountType::AppSession,
            other => return Err(anyhow!("unknown account type {other}")),
        })
    }
}

impl ToSql for AccountType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AccountType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        AccountType::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Account {
    pub account_type: AccountType,
    pub id: String,
}

impl Account {
    pub fn wallet(address: Address) -> Self {
        Account {
            account_type: AccountType::Wallet,
            id: address.to_string(),
        }
    }

    pub fn custody(address: Address) -> Self {
        Account {
            account_type: AccountType::Custody,
            id: address.to_string(),
        }
    }

    pub fn escrow(channel_id: B256) -> Self {
        Account {
            account_type: AccountType::Escrow,
            id: channel_id.to_string(),
        }
    }

    pub fn app_session(session_id: B256) -> Self {
        Account {
            account_type: AccountType::AppSession,
            id: session_id.to_string(),
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_type.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: String,
    pub account_type: AccountType,
    pub asset: String,
    pub participant: Address,
    pub credit: Amount,
    pub debit: Amount,
    /// The session key which authorized this debit, if any.
    pub session_key: Option<Address>,
    pub created_at: u64,
}

impl LedgerEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LedgerEntry {
            id: row.get(0)?,
            account_id: row.get(1)?,
            account_type: row.get(2)?,
            asset: row.get(3)?,
            participant: row.get::<_, AddressSqlable>(4)?.into(),
            credit: row.get(5)?,
            debit: row.get(6)?,
            session_key: row.get::<_, Option<AddressSqlable>>(7)?.map(Into::into),
            created_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Deposit,
    Withdrawal,
    EscrowLock,
    EscrowUnlock,
    AppDeposit,
    AppWithdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::EscrowLock => "escrow_lock",
            TransactionType::EscrowUnlock => "escrow_unlock",
            TransactionType::AppDeposit => "app_deposit",
            TransactionType::AppWithdrawal => "app_withdrawal",
        }
    }
}

impl FromStr for TransactionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| anyhow!("unknown transaction type {s}"))
    }
}

impl ToSql for TransactionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransactionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        TransactionType::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: i64,
    pub tx_type: TransactionType,
    pub from_account: Account,
    pub to_account: Account,
    pub asset: String,
    pub amount: Amount,
    pub created_at: u64,
}

impl LedgerTransaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LedgerTransaction {
            id: row.get(0)?,
            tx_type: row.get(1)?,
            from_account: Account {
                id: row.get(2)?,
                account_type: row.get(3)?,
            },
            to_account: Account {
                id: row.get(4)?,
                account_type: row.get(5)?,
            },
            asset: row.get(6)?,
            amount: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// One side of a movement of funds: the account and the participant the entry is recorded against.
#[derive(Debug, Clone)]
pub struct Posting {
    pub account: Account,
    pub participant: Address,
}

impl Posting {
    pub fn wallet(address: Address) -> Self {
        Posting {
            account: Account::wallet(address),
            participant: address,
        }
    }

    pub fn custody(address: Address) -> Self {
        Posting {
            account: Account::custody(address),
            participant: address,
        }
    }

    pub fn escrow(channel_id: B256, owner: Address) -> Self {
        Posting {
            account: Account::escrow(channel_id),
            participant: owner,
        }
    }

    pub fn app_session(session_id: B256, participant: Address) -> Self {
        Posting {
            account: Account::app_session(session_id),
            participant,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub account_id: Option<String>,
    pub asset: Option<String>,
    pub participant: Option<Address>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Matches transactions from or to this account id.
    pub account_id: Option<String>,
    pub asset: Option<String>,
    pub tx_type: Option<TransactionType>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One asset's balance, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub amount: Amount,
}

const DEFAULT_PAGE_SIZE: u64 = 100;

pub struct Ledger<'a> {
    conn: &'a Connection,
    now: u64,
}

impl<'a> Ledger<'a> {
    pub fn new(conn: &'a Connection, now: u64) -> Self {
        Ledger { conn, now }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn balance(&self, account: &Account, asset: &str) -> Result<Amount> {
        let mut statement = self.conn.prepare_cached(
            "SELECT credit, debit FROM ledger_entries WHERE account_id = ?1 AND account_type = ?2 AND asset = ?3",
        )?;
        let rows = statement.query_map(params![account.id, account.account_type, asset], |row| {
            Ok((row.get::<_, Amount>(0)?, row.get::<_, Amount>(1)?))
        })?;
        let mut credit = 0u128;
        let mut debit = 0u128;
        for row in rows {
            let (c, d) = row?;
            credit = credit
                .checked_add(c.0)
                .ok_or_else(|| anyhow!("credit overflow on {account}"))?;
            debit = debit
                .checked_add(d.0)
                .ok_or_else(|| anyhow!("debit overflow on {account}"))?;
        }
        credit
            .checked_sub(debit)
            .map(Amount)
            .ok_or_else(|| anyhow!("negative balance on {account} for {asset}"))
    }

    /// Non-zero balances of `account`, by asset.
    pub fn balances(&self, account: &Account) -> Result<BTreeMap<String, Amount>> {
        let mut statement = self.conn.prepare_cached(
            "SELECT DISTINCT asset FROM ledger_entries WHERE account_id = ?1 AND account_type = ?2",
        )?;
        let assets = statement
            .query_map(params![account.id, account.account_type], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut balances = BTreeMap::new();
        for asset in assets {
            let balance = self.balance(account, &asset)?;
            if !balance.is_zero() {
                balances.insert(asset, balance);
            }
        }
        Ok(balances)
    }

    pub fn balance_list(&self, account: &Account) -> Result<Vec<Balance>> {
        Ok(self
            .balances(account)?
            .into_iter()
            .map(|(asset, amount)| Balance { asset, amount })
            .collect())
    }

    pub fn credit(&self, to: &Posting, asset: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.insert_entry(to, asset, amount, Amount::ZERO, None)
    }

    /// Debits `from`, rejecting the debit if it would overdraw the account or, when `spender` is a session key,
    /// exceed its allowance.
    pub fn debit(
        &self,
        from: &Posting,
        asset: &str,
        amount: Amount,
        spender: Option<&SessionKey>,
    ) -> Result<(), RpcError> {
        if amount.is_zero() {
            return Ok(());
        }
        if let Some(key) = spender {
            session_keys::check_allowance(self.conn, key, asset, amount)?;
        }
        let balance = self.balance(&from.account, asset)?;
        if balance < amount {
            return Err(RpcError::validation(format!(
                "insufficient balance in {}: {balance} {asset} available, {amount} required",
                from.account
            )));
        }
        self.insert_entry(from, asset, Amount::ZERO, amount, spender.map(|k| k.address))?;
        Ok(())
    }

    /// Moves `amount` from one account to another and records the movement as a transaction.
    pub fn transfer(
        &self,
        tx_type: TransactionType,
        from: &Posting,
        to: &Posting,
        asset: &str,
        amount: Amount,
        spender: Option<&SessionKey>,
    ) -> Result<LedgerTransaction, RpcError> {
        if amount.is_zero() {
            return Err(RpcError::validation("amount must be positive"));
        }
        if from.account == to.account {
            return Err(RpcError::validation("cannot transfer to the same account"));
        }
        self.debit(from, asset, amount, spender)?;
        self.credit(to, asset, amount)?;
        let transaction = self.record_transaction(tx_type, &from.account, &to.account, asset, amount)?;
        debug!(
            tx_type = tx_type.as_str(),
            from = %from.account,
            to = %to.account,
            asset,
            %amount,
            "ledger transfer"
        );
        Ok(transaction)
    }

    pub fn record_transaction(
        &self,
        tx_type: TransactionType,
        from: &Account,
        to: &Account,
        asset: &str,
        amount: Amount,
    ) -> Result<LedgerTransaction> {
        self.conn.execute(
            "INSERT INTO ledger_transactions (tx_type, from_account, from_account_type, to_account, to_account_type, asset, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx_type,
                from.id,
                from.account_type,
                to.id,
                to.account_type,
                asset,
                amount,
                self.now
            ],
        )?;
        Ok(LedgerTransaction {
            id: self.conn.last_insert_rowid(),
            tx_type,
            from_account: from.clone(),
            to_account: to.clone(),
            asset: asset.to_owned(),
            amount,
            created_at: self.now,
        })
    }

    pub fn entries(&self, filter: &EntryFilter) -> Result<Vec<LedgerEntry>> {
        let mut statement = self.conn.prepare_cached(
            "SELECT id, account_id, account_type, asset, wallet, credit, debit, session_key, created_at
             FROM ledger_entries
             WHERE (?1 IS NULL OR account_id = ?1) AND (?2 IS NULL OR asset = ?2) AND (?3 IS NULL OR wallet = ?3)
             ORDER BY id DESC LIMIT ?4 OFFSET ?5",
        )?;
        let entries = statement
            .query_map(
                params![
                    filter.account_id,
                    filter.asset,
                    filter.participant.map(AddressSqlable),
                    filter.limit.unwrap_or(DEFAULT_PAGE_SIZE),
                    filter.offset.unwrap_or(0)
                ],
                LedgerEntry::from_row,
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(entries)
    }

    pub fn transactions(&self, filter: &TransactionFilter) -> Result<Vec<LedgerTransaction>> {
        let mut statement = self.conn.prepare_cached(
            "SELECT id, tx_type, from_account, from_account_type, to_account, to_account_type, asset, amount, created_at
             FROM ledger_transactions
             WHERE (?1 IS NULL OR from_account = ?1 OR to_account = ?1) AND (?2 IS NULL OR asset = ?2)
                AND (?3 IS NULL OR tx_type = ?3)
             ORDER BY id DESC LIMIT ?4 OFFSET ?5",
        )?;
        let transactions = statement
            .query_map(
                params![
                    filter.account_id,
                    filter.asset,
                    filter.tx_type,
                    filter.limit.unwrap_or(DEFAULT_PAGE_SIZE),
                    filter.offset.unwrap_or(0)
                ],
                LedgerTransaction::from_row,
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(transactions)
    }

    fn insert_entry(
        &self,
        posting: &Posting,
        asset: &str,
        credit: Amount,
        debit: Amount,
        session_key: Option<Address>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ledger_entries (account_id, account_type, asset, wallet, credit, debit, session_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                posting.account.id,
                posting.account.account_type,
                asset,
                AddressSqlable(posting.participant),
                credit,
                debit,
                session_key.map(AddressSqlable),
                self.now
            ],
        )?;
        Ok(())
    }
}
