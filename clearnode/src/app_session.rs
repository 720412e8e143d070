//! App sessions: off-chain multi-party virtual channels secured by weighted signatures.
//!
//! Funds inside a session live in the session's ledger account. Ordinary updates only redistribute them between
//! participants. Deposit and withdraw updates move funds between the session and participants' unified balances.

use std::{collections::BTreeMap, fmt, str::FromStr};

use alloy::{
    primitives::{Address, B256, keccak256},
    sol_types::SolValue,
};
use anyhow::{Result, anyhow};
use rusqlite::{
    Connection, OptionalExtension, Row, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    cfg::{Amount, Config},
    channels::ensure_no_pending_resize,
    db::{AddressSqlable, HashSqlable, from_json, sqlify_with_json, to_json},
    error::RpcError,
    ledger::{Account, Ledger, Posting, TransactionType},
    serde_util::rfc3339,
    session_keys::Signer,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub application: String,
    pub protocol: String,
    pub participants: Vec<Address>,
    /// Signing weight of each participant, aligned with `participants`.
    pub weights: Vec<u64>,
    /// The combined weight an update needs.
    pub quorum: u64,
    #[serde(default)]
    pub challenge: u64,
    #[serde(default)]
    pub nonce: u64,
}

impl AppDefinition {
    pub fn session_id(&self) -> B256 {
        keccak256(
            (
                self.application.clone(),
                self.protocol.clone(),
                self.participants.clone(),
                self.weights.clone(),
                self.quorum,
                self.challenge,
                self.nonce,
            )
                .abi_encode(),
        )
    }

    fn validate(&self) -> Result<(), RpcError> {
        if self.application.is_empty() {
            return Err(RpcError::validation("application must not be empty"));
        }
        if self.participants.is_empty() {
            return Err(RpcError::validation("an app session needs participants"));
        }
        if self.weights.len() != self.participants.len() {
            return Err(RpcError::validation(format!(
                "{} weights for {} participants",
                self.weights.len(),
                self.participants.len()
            )));
        }
        for (i, participant) in self.participants.iter().enumerate() {
            if self.participants[..i].contains(participant) {
                return Err(RpcError::validation(format!(
                    "duplicate participant {participant}"
                )));
            }
        }
        let total: u64 = self.weights.iter().try_fold(0u64, |acc, w| acc.checked_add(*w)).ok_or_else(|| {
            RpcError::validation("weights overflow")
        })?;
        if self.quorum == 0 || self.quorum > total {
            return Err(RpcError::validation(format!(
                "quorum {} is not reachable with total weight {total}",
                self.quorum
            )));
        }
        Ok(())
    }

    /// The combined weight of the participants among `signers`. Each participant counts once.
    pub fn signed_weight(&self, signers: &[Signer]) -> u64 {
        self.participants
            .iter()
            .zip(&self.weights)
            .filter(|(participant, _)| signers.iter().any(|s| s.wallet() == **participant))
            .map(|(_, weight)| *weight)
            .sum()
    }

    fn require_quorum(&self, signers: &[Signer]) -> Result<(), RpcError> {
        let weight = self.signed_weight(signers);
        if weight < self.quorum {
            return Err(RpcError::authentication(format!(
                "quorum not reached: signed weight {weight} of {}",
                self.quorum
            )));
        }
        Ok(())
    }

    /// Session keys may only act within their own application, unless they are root keys.
    fn require_scope(&self, signers: &[Signer]) -> Result<(), RpcError> {
        if let Some(key) = signers
            .iter()
            .filter_map(Signer::session_key)
            .find(|key| !key.may_act_for(&self.application))
        {
            return Err(RpcError::authentication(format!(
                "session key {} is scoped to {}, not {}",
                key.address, key.application, self.application
            )));
        }
        Ok(())
    }
}

sqlify_with_json!(AppDefinition);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAllocation {
    pub participant: Address,
    pub asset: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppSessionStatus {
    Open,
    Closed,
}

impl AppSessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AppSessionStatus::Open => "open",
            AppSessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for AppSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppSessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(AppSessionStatus::Open),
            "closed" => Ok(AppSessionStatus::Closed),
            other => Err(anyhow!("unknown app session status {other}")),
        }
    }
}

impl ToSql for AppSessionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AppSessionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        AppSessionStatus::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppIntent {
    /// Redistribute funds already in the session.
    #[default]
    Operate,
    Deposit,
    Withdraw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSession {
    pub app_session_id: B256,
    pub definition: AppDefinition,
    pub version: u64,
    pub status: AppSessionStatus,
    pub allocations: Vec<AppAllocation>,
    pub session_data: Option<String>,
    #[serde(with = "rfc3339")]
    pub created_at: u64,
    #[serde(with = "rfc3339")]
    pub updated_at: u64,
}

impl AppSession {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let json_error = |index: usize| {
            move |e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
            }
        };
        let allocations: String = row.get(4)?;
        Ok(AppSession {
            app_session_id: row.get::<_, HashSqlable>(0)?.into(),
            definition: row.get(1)?,
            version: row.get(2)?,
            status: row.get(3)?,
            allocations: from_json(&allocations).map_err(json_error(4))?,
            session_data: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppSession {
    pub definition: AppDefinition,
    #[serde(default)]
    pub allocations: Vec<AppAllocation>,
    #[serde(default)]
    pub session_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAppState {
    pub app_session_id: B256,
    #[serde(default)]
    pub intent: AppIntent,
    pub version: u64,
    pub allocations: Vec<AppAllocation>,
    #[serde(default)]
    pub session_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseAppSession {
    pub app_session_id: B256,
    pub allocations: Vec<AppAllocation>,
    #[serde(default)]
    pub session_data: Option<String>,
}

const SELECT_SESSION: &str =
    "SELECT session_id, definition, version, status, allocations, session_data, created_at, updated_at
     FROM app_sessions";

pub fn get(conn: &Connection, app_session_id: B256) -> Result<Option<AppSession>> {
    Ok(conn
        .query_row(
            &format!("{SELECT_SESSION} WHERE session_id = ?1"),
            [HashSqlable(app_session_id)],
            AppSession::from_row,
        )
        .optional()?)
}

/// Sessions, newest first, optionally filtered by participant and status.
pub fn list(
    conn: &Connection,
    participant: Option<Address>,
    status: Option<AppSessionStatus>,
) -> Result<Vec<AppSession>> {
    let mut statement = conn.prepare_cached(&format!(
        "{SELECT_SESSION} WHERE (?1 IS NULL OR session_id IN
            (SELECT session_id FROM app_session_participants WHERE wallet = ?1))
         AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, session_id"
    ))?;
    let sessions = statement
        .query_map(
            params![participant.map(AddressSqlable), status],
            AppSession::from_row,
        )?
        .collect::<rusqlite::Result<_>>()?;
    Ok(sessions)
}

type Allocations = BTreeMap<(Address, String), Amount>;

/// Indexes `allocations` by participant and asset, dropping zero amounts.
fn index(
    config: &Config,
    definition: &AppDefinition,
    allocations: &[AppAllocation],
) -> Result<Allocations, RpcError> {
    let mut indexed = BTreeMap::new();
    for allocation in allocations {
        if !definition.participants.contains(&allocation.participant) {
            return Err(RpcError::validation(format!(
                "{} is not a participant",
                allocation.participant
            )));
        }
        if config.asset_by_symbol(&allocation.asset).is_none() {
            return Err(RpcError::validation(format!(
                "unsupported asset {}",
                allocation.asset
            )));
        }
        let key = (allocation.participant, allocation.asset.clone());
        if indexed.contains_key(&key) {
            return Err(RpcError::validation(format!(
                "duplicate allocation for {} in {}",
                allocation.participant, allocation.asset
            )));
        }
        if !allocation.amount.is_zero() {
            indexed.insert(key, allocation.amount);
        }
    }
    Ok(indexed)
}

fn totals(allocations: &Allocations) -> Result<BTreeMap<String, Amount>, RpcError> {
    let mut totals = BTreeMap::new();
    for ((_, asset), amount) in allocations {
        let total: &mut Amount = totals.entry(asset.clone()).or_default();
        *total = total
            .checked_add(*amount)
            .ok_or_else(|| RpcError::validation(format!("{asset} allocations overflow")))?;
    }
    Ok(totals)
}

fn flatten(allocations: &Allocations) -> Vec<AppAllocation> {
    allocations
        .iter()
        .map(|((participant, asset), amount)| AppAllocation {
            participant: *participant,
            asset: asset.clone(),
            amount: *amount,
        })
        .collect()
}

fn signer_for(signers: &[Signer], wallet: Address) -> Option<&Signer> {
    signers.iter().find(|s| s.wallet() == wallet)
}

fn open_session(conn: &Connection, app_session_id: B256) -> Result<AppSession, RpcError> {
    let session = get(conn, app_session_id)?
        .ok_or_else(|| RpcError::not_found(format!("app session {app_session_id}")))?;
    if session.status != AppSessionStatus::Open {
        return Err(RpcError::validation(format!(
            "app session {app_session_id} is {}",
            session.status
        )));
    }
    Ok(session)
}

/// Moves a participant's contribution from its unified balance into the session. The participant must have signed.
fn fund(
    ledger: &Ledger,
    conn: &Connection,
    signers: &[Signer],
    app_session_id: B256,
    participant: Address,
    asset: &str,
    amount: Amount,
) -> Result<(), RpcError> {
    let signer = signer_for(signers, participant).ok_or_else(|| {
        RpcError::authentication(format!("{participant} must sign to move its funds"))
    })?;
    ensure_no_pending_resize(conn, participant)?;
    ledger.transfer(
        TransactionType::AppDeposit,
        &Posting::wallet(participant),
        &Posting::app_session(app_session_id, participant),
        asset,
        amount,
        signer.session_key(),
    )?;
    Ok(())
}

fn release(
    ledger: &Ledger,
    app_session_id: B256,
    participant: Address,
    asset: &str,
    amount: Amount,
) -> Result<(), RpcError> {
    ledger.transfer(
        TransactionType::AppWithdrawal,
        &Posting::app_session(app_session_id, participant),
        &Posting::wallet(participant),
        asset,
        amount,
        None,
    )?;
    Ok(())
}

fn save(conn: &Connection, session: &AppSession) -> Result<()> {
    conn.execute(
        "UPDATE app_sessions SET version = ?2, status = ?3, allocations = ?4, session_data = ?5, updated_at = ?6
         WHERE session_id = ?1",
        params![
            HashSqlable(session.app_session_id),
            session.version,
            session.status,
            to_json(&session.allocations)?,
            session.session_data,
            session.updated_at,
        ],
    )?;
    Ok(())
}

/// Opens a session. Every participant contributing funds must sign.
pub fn create(
    conn: &Connection,
    config: &Config,
    now: u64,
    params: &CreateAppSession,
    signers: &[Signer],
) -> Result<AppSession, RpcError> {
    let definition = &params.definition;
    definition.validate()?;
    definition.require_scope(signers)?;
    let app_session_id = definition.session_id();
    if get(conn, app_session_id)?.is_some() {
        return Err(RpcError::state_conflict(format!(
            "app session {app_session_id} already exists"
        )));
    }
    let allocations = index(config, definition, &params.allocations)?;

    // The session's row must exist before ledger entries reference it by id.
    let session = AppSession {
        app_session_id,
        definition: definition.clone(),
        version: 1,
        status: AppSessionStatus::Open,
        allocations: flatten(&allocations),
        session_data: params.session_data.clone(),
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO app_sessions (session_id, definition, version, status, allocations, session_data, created_at,
            updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            HashSqlable(app_session_id),
            session.definition,
            session.version,
            session.status,
            to_json(&session.allocations)?,
            session.session_data,
            now,
            now,
        ],
    )?;
    for participant in &definition.participants {
        conn.execute(
            "INSERT INTO app_session_participants (session_id, wallet) VALUES (?1, ?2)",
            params![HashSqlable(app_session_id), AddressSqlable(*participant)],
        )?;
    }

    let ledger = Ledger::new(conn, now);
    for ((participant, asset), amount) in &allocations {
        fund(&ledger, conn, signers, app_session_id, *participant, asset, *amount)?;
    }
    info!(%app_session_id, application = %definition.application, "app session created");
    Ok(session)
}

/// Applies the next version of a session. The signers must reach the quorum.
pub fn submit(
    conn: &Connection,
    config: &Config,
    now: u64,
    params: &SubmitAppState,
    signers: &[Signer],
) -> Result<AppSession, RpcError> {
    let mut session = open_session(conn, params.app_session_id)?;
    let definition = &session.definition;
    if params.version != session.version + 1 {
        return Err(RpcError::state_conflict(format!(
            "expected version {}, got {}",
            session.version + 1,
            params.version
        )));
    }
    definition.require_scope(signers)?;
    definition.require_quorum(signers)?;
    let current = index(config, definition, &session.allocations)?;
    let next = index(config, definition, &params.allocations)?;

    let ledger = Ledger::new(conn, now);
    match params.intent {
        AppIntent::Operate => {
            if totals(&current)? != totals(&next)? {
                return Err(RpcError::validation(
                    "operate updates must conserve the total of each asset",
                ));
            }
        }
        AppIntent::Deposit | AppIntent::Withdraw => {
            let mut moved = false;
            let keys: std::collections::BTreeSet<_> = current.keys().chain(next.keys()).collect();
            for key in keys {
                let (participant, asset) = key;
                let before = current.get(key).copied().unwrap_or_default();
                let after = next.get(key).copied().unwrap_or_default();
                if before == after {
                    continue;
                }
                moved = true;
                match (params.intent, after > before) {
                    (AppIntent::Deposit, true) => fund(
                        &ledger,
                        conn,
                        signers,
                        session.app_session_id,
                        *participant,
                        asset,
                        after.saturating_sub(before),
                    )?,
                    (AppIntent::Withdraw, false) => release(
                        &ledger,
                        session.app_session_id,
                        *participant,
                        asset,
                        before.saturating_sub(after),
                    )?,
                    (intent, _) => {
                        return Err(RpcError::validation(format!(
                            "{intent:?} update moves {asset} of {participant} the wrong way"
                        )));
                    }
                }
            }
            if !moved {
                return Err(RpcError::validation(format!(
                    "{:?} update does not change any allocation",
                    params.intent
                )));
            }
        }
    }

    session.version = params.version;
    session.allocations = flatten(&next);
    if params.session_data.is_some() {
        session.session_data = params.session_data.clone();
    }
    session.updated_at = now;
    save(conn, &session)?;
    debug!(app_session_id = %session.app_session_id, version = session.version, intent = ?params.intent, "app state submitted");
    Ok(session)
}

/// Closes a session, paying out the final allocations to participants' unified balances.
pub fn close(
    conn: &Connection,
    config: &Config,
    now: u64,
    params: &CloseAppSession,
    signers: &[Signer],
) -> Result<AppSession, RpcError> {
    let mut session = open_session(conn, params.app_session_id)?;
    let definition = &session.definition;
    definition.require_scope(signers)?;
    definition.require_quorum(signers)?;
    let last = index(config, definition, &params.allocations)?;

    let ledger = Ledger::new(conn, now);
    let held = ledger.balances(&Account::app_session(session.app_session_id))?;
    if totals(&last)? != held {
        return Err(RpcError::validation(
            "final allocations must distribute exactly the session's funds",
        ));
    }
    for ((participant, asset), amount) in &last {
        release(&ledger, session.app_session_id, *participant, asset, *amount)?;
    }

    session.version += 1;
    session.status = AppSessionStatus::Closed;
    session.allocations = flatten(&last);
    if params.session_data.is_some() {
        session.session_data = params.session_data.clone();
    }
    session.updated_at = now;
    save(conn, &session)?;
    info!(app_session_id = %session.app_session_id, "app session closed");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::{AssetConfig, AuthConfig, ChainConfig, SyncConfig},
        db::Db,
        session_keys::{Allowance, ScopeTag, SessionKey},
    };

    const NOW: u64 = 1_000;

    fn config() -> Config {
        Config {
            listen_address: crate::cfg::listen_address_default(),
            database_path: None,
            chain: ChainConfig {
                chain_id: 1,
                custody_address: Address::repeat_byte(0xcc),
                adjudicator_address: Address::repeat_byte(0xad),
                challenge_period: 3_600,
                eip712: true,
            },
            assets: vec![AssetConfig {
                symbol: "usdc".to_owned(),
                token: Address::repeat_byte(0x70),
                decimals: 6,
            }],
            auth: AuthConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    fn alloc(participant: Address, amount: u128) -> AppAllocation {
        AppAllocation {
            participant,
            asset: "usdc".to_owned(),
            amount: Amount(amount),
        }
    }

    struct Setup {
        db: Db,
        config: Config,
        parties: [Address; 3],
    }

    impl Setup {
        /// Three funded parties with weights 60, 39 and 1 and a quorum of 100.
        fn new() -> Self {
            let db = Db::new_in_memory().unwrap();
            let parties = [1, 2, 3].map(Address::repeat_byte);
            db.with_transaction(|tx| {
                let ledger = Ledger::new(tx, NOW);
                for party in parties {
                    ledger.credit(&Posting::wallet(party), "usdc", Amount(100))?;
                }
                anyhow::Ok(())
            })
            .unwrap();
            Setup {
                db,
                config: config(),
                parties,
            }
        }

        fn definition(&self) -> AppDefinition {
            AppDefinition {
                application: "chess".to_owned(),
                protocol: "v1".to_owned(),
                participants: self.parties.to_vec(),
                weights: vec![60, 39, 1],
                quorum: 100,
                challenge: 0,
                nonce: 1,
            }
        }

        fn signers(&self, indices: &[usize]) -> Vec<Signer> {
            indices.iter().map(|i| Signer::Wallet(self.parties[*i])).collect()
        }

        fn create(&self) -> AppSession {
            self.db
                .with_transaction(|tx| {
                    create(
                        tx,
                        &self.config,
                        NOW,
                        &CreateAppSession {
                            definition: self.definition(),
                            allocations: vec![alloc(self.parties[0], 10), alloc(self.parties[1], 10)],
                            session_data: None,
                        },
                        &self.signers(&[0, 1]),
                    )
                })
                .unwrap()
        }

        fn balance(&self, account: Account) -> Amount {
            self.db
                .read(|conn| Ledger::new(conn, NOW).balance(&account, "usdc"))
                .unwrap()
        }

        fn submit(
            &self,
            intent: AppIntent,
            version: u64,
            allocations: Vec<AppAllocation>,
            signers: &[usize],
        ) -> Result<AppSession, RpcError> {
            let app_session_id = self.definition().session_id();
            self.db.with_transaction(|tx| {
                submit(
                    tx,
                    &self.config,
                    NOW,
                    &SubmitAppState {
                        app_session_id,
                        intent,
                        version,
                        allocations,
                        session_data: None,
                    },
                    &self.signers(signers),
                )
            })
        }
    }

    #[test]
    fn create_moves_funds_into_session() {
        let setup = Setup::new();
        let session = setup.create();
        assert_eq!(session.version, 1);
        assert_eq!(setup.balance(Account::wallet(setup.parties[0])), Amount(90));
        assert_eq!(setup.balance(Account::app_session(session.app_session_id)), Amount(20));
    }

    #[test]
    fn funding_participant_must_sign() {
        let setup = Setup::new();
        let result = setup.db.with_transaction(|tx| {
            create(
                tx,
                &setup.config,
                NOW,
                &CreateAppSession {
                    definition: setup.definition(),
                    allocations: vec![alloc(setup.parties[0], 10), alloc(setup.parties[1], 10)],
                    session_data: None,
                },
                &setup.signers(&[0]),
            )
        });
        assert!(matches!(result, Err(RpcError::Authentication(_))));
        assert_eq!(setup.balance(Account::wallet(setup.parties[0])), Amount(100));
    }

    #[test]
    fn quorum_is_exact() {
        let setup = Setup::new();
        setup.create();
        let next = vec![alloc(setup.parties[0], 5), alloc(setup.parties[1], 15)];
        // 60 + 39 is one short of the quorum.
        let result = setup.submit(AppIntent::Operate, 2, next.clone(), &[0, 1]);
        assert!(matches!(result, Err(RpcError::Authentication(_))));
        let session = setup.submit(AppIntent::Operate, 2, next, &[0, 1, 2]).unwrap();
        assert_eq!(session.version, 2);
    }

    #[test]
    fn versions_must_follow_on() {
        let setup = Setup::new();
        setup.create();
        let same = vec![alloc(setup.parties[0], 10), alloc(setup.parties[1], 10)];
        for version in [1, 3] {
            let result = setup.submit(AppIntent::Operate, version, same.clone(), &[0, 1, 2]);
            assert!(matches!(result, Err(RpcError::StateConflict(_))));
        }
    }

    #[test]
    fn operate_must_conserve_totals() {
        let setup = Setup::new();
        setup.create();
        let inflated = vec![alloc(setup.parties[0], 10), alloc(setup.parties[1], 11)];
        let result = setup.submit(AppIntent::Operate, 2, inflated, &[0, 1, 2]);
        assert!(matches!(result, Err(RpcError::Validation(_))));
    }

    #[test]
    fn deposit_and_withdraw_move_funds() {
        let setup = Setup::new();
        let session = setup.create();
        let deposited = vec![
            alloc(setup.parties[0], 10),
            alloc(setup.parties[1], 10),
            alloc(setup.parties[2], 30),
        ];
        setup
            .submit(AppIntent::Deposit, 2, deposited, &[0, 1, 2])
            .unwrap();
        assert_eq!(setup.balance(Account::wallet(setup.parties[2])), Amount(70));

        // A deposit cannot take funds out.
        let shrunk = vec![alloc(setup.parties[0], 10), alloc(setup.parties[1], 10)];
        let result = setup.submit(AppIntent::Deposit, 3, shrunk.clone(), &[0, 1, 2]);
        assert!(matches!(result, Err(RpcError::Validation(_))));

        setup.submit(AppIntent::Withdraw, 3, shrunk, &[0, 1, 2]).unwrap();
        assert_eq!(setup.balance(Account::wallet(setup.parties[2])), Amount(100));
        assert_eq!(setup.balance(Account::app_session(session.app_session_id)), Amount(20));
    }

    #[test]
    fn close_pays_out_final_allocations() {
        let setup = Setup::new();
        let session = setup.create();
        let close_with = |allocations| {
            setup.db.with_transaction(|tx| {
                close(
                    tx,
                    &setup.config,
                    NOW,
                    &CloseAppSession {
                        app_session_id: session.app_session_id,
                        allocations,
                        session_data: Some("{\"winner\":1}".to_owned()),
                    },
                    &setup.signers(&[0, 1, 2]),
                )
            })
        };
        let result = close_with(vec![alloc(setup.parties[1], 25)]);
        assert!(matches!(result, Err(RpcError::Validation(_))));

        let closed = close_with(vec![alloc(setup.parties[1], 20)]).unwrap();
        assert_eq!(closed.status, AppSessionStatus::Closed);
        assert_eq!(setup.balance(Account::wallet(setup.parties[0])), Amount(90));
        assert_eq!(setup.balance(Account::wallet(setup.parties[1])), Amount(110));
        assert_eq!(setup.balance(Account::app_session(session.app_session_id)), Amount::ZERO);
    }

    #[test]
    fn session_keys_stay_within_their_application() {
        let setup = Setup::new();
        setup.create();
        let key = |application: &str, tag| {
            Signer::SessionKey(SessionKey {
                address: Address::repeat_byte(0x51),
                wallet: setup.parties[0],
                application: application.to_owned(),
                scope: "app".to_owned(),
                tag,
                allowances: vec![Allowance {
                    asset: "usdc".to_owned(),
                    amount: Amount(100),
                }],
                expires_at: NOW + 100,
                created_at: NOW,
                revoked: false,
                registered_block: 0,
            })
        };
        let app_session_id = setup.definition().session_id();
        let same = vec![alloc(setup.parties[0], 10), alloc(setup.parties[1], 10)];
        let attempt = |signer: Signer| {
            let mut signers = setup.signers(&[1, 2]);
            signers.push(signer);
            setup.db.with_transaction(|tx| {
                submit(
                    tx,
                    &setup.config,
                    NOW,
                    &SubmitAppState {
                        app_session_id,
                        intent: AppIntent::Operate,
                        version: 2,
                        allocations: same.clone(),
                        session_data: None,
                    },
                    &signers,
                )
            })
        };
        assert!(matches!(
            attempt(key("poker", ScopeTag::Application)),
            Err(RpcError::Authentication(_))
        ));
        attempt(key("poker", ScopeTag::Root)).unwrap();
    }
}
