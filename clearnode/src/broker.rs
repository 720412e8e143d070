//! The broker: every operation a client can ask for, with the locking and notifications around it.

use std::sync::Arc;

use alloy::primitives::{Address, B256, Bytes};
use custody::{crypto::SecretKey, state::ChannelId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::{
    app_session::{
        self, AppDefinition, AppSession, AppSessionStatus, CloseAppSession, CreateAppSession,
        SubmitAppState,
    },
    auth::{self, AuthRequest, Authenticated},
    cfg::{Amount, Config},
    channels::{
        self, ChannelInfo, ChannelStatus, CloseChannel, Context, CreateChannel, ResizeChannel,
        SignedChannelState, ensure_no_pending_resize,
    },
    db::Db,
    error::RpcError,
    ledger::{
        Account, Balance, EntryFilter, Ledger, LedgerEntry, LedgerTransaction, Posting,
        TransactionFilter, TransactionType,
    },
    locks::{LockKey, Locks},
    notify::{NotificationKind, Notifier},
    rpc::{
        envelope::RpcPayload,
        history::{self, RpcRecord},
    },
    serde_util::rfc3339,
    session_keys::{self, Signer},
    time::unix_secs,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub chain_id: u64,
    pub custody_address: Address,
    pub adjudicator_address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub broker_address: Address,
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetInfo {
    pub token: Address,
    pub chain_id: u64,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetAssets {
    #[serde(default)]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLedgerBalances {
    /// A wallet address or an app session id. Defaults to the caller's wallet.
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLedgerEntries {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub wallet: Option<Address>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLedgerTransactions {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub tx_type: Option<TransactionType>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetChannels {
    #[serde(default)]
    pub participant: Option<Address>,
    #[serde(default)]
    pub status: Option<ChannelStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetAppSessions {
    #[serde(default)]
    pub participant: Option<Address>,
    #[serde(default)]
    pub status: Option<AppSessionStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAppDefinition {
    pub app_session_id: B256,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRpcHistory {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub destination: Address,
    pub allocations: Vec<Balance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSessionKey {
    pub session_key: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowanceUsage {
    pub asset: String,
    pub allowance: Amount,
    pub used: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyInfo {
    pub session_key: Address,
    pub application: String,
    pub scope: String,
    pub allowances: Vec<AllowanceUsage>,
    #[serde(with = "rfc3339")]
    pub expires_at: u64,
    #[serde(with = "rfc3339")]
    pub created_at: u64,
}

const DEFAULT_HISTORY_PAGE: u64 = 50;

pub struct Broker {
    db: Arc<Db>,
    config: Arc<Config>,
    key: SecretKey,
    locks: Locks,
    notifier: Notifier,
}

impl Broker {
    pub fn new(db: Arc<Db>, config: Arc<Config>, key: SecretKey, notifier: Notifier) -> Self {
        Broker {
            db,
            config,
            key,
            locks: Locks::new(),
            notifier,
        }
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn ctx(&self) -> Context<'_> {
        Context {
            config: &self.config,
            broker: &self.key,
            now: unix_secs(),
        }
    }

    pub fn config_info(&self) -> BrokerInfo {
        BrokerInfo {
            broker_address: self.key.address(),
            networks: vec![NetworkInfo {
                chain_id: self.config.chain.chain_id,
                custody_address: self.config.chain.custody_address,
                adjudicator_address: self.config.chain.adjudicator_address,
            }],
        }
    }

    pub fn assets(&self, params: &GetAssets) -> Vec<AssetInfo> {
        let chain_id = self.config.chain.chain_id;
        if params.chain_id.is_some_and(|id| id != chain_id) {
            return vec![];
        }
        self.config
            .assets
            .iter()
            .map(|asset| AssetInfo {
                token: asset.token,
                chain_id,
                symbol: asset.symbol.clone(),
                decimals: asset.decimals,
            })
            .collect()
    }

    /// Maps the addresses which signed a request to the wallets they act for.
    pub fn resolve_signers(&self, addresses: &[Address]) -> Result<Vec<Signer>, RpcError> {
        let now = unix_secs();
        self.db.read(|conn| {
            addresses
                .iter()
                .map(|address| session_keys::resolve_signer(conn, *address, now))
                .collect()
        })
    }

    pub fn auth_request(&self, request: &AuthRequest) -> Result<String, RpcError> {
        self.db
            .with_transaction(|tx| auth::issue_challenge(tx, &self.config.auth, request, unix_secs()))
    }

    pub fn auth_verify(&self, challenge: &str, signatures: &[Bytes]) -> Result<Authenticated, RpcError> {
        self.db.with_transaction(|tx| {
            auth::verify(tx, &self.config.auth, challenge, signatures, unix_secs())
        })
    }

    pub fn balances(&self, caller: Option<Address>, params: &GetLedgerBalances) -> Result<Vec<Balance>, RpcError> {
        let account = match params.account_id.as_deref() {
            Some(id) => parse_account(id)?,
            None => Account::wallet(caller.ok_or_else(|| {
                RpcError::authentication("authenticate or name an account")
            })?),
        };
        Ok(self
            .db
            .read(|conn| Ledger::new(conn, 0).balance_list(&account))?)
    }

    pub fn entries(&self, params: &GetLedgerEntries) -> Result<Vec<LedgerEntry>, RpcError> {
        let filter = EntryFilter {
            account_id: params.account_id.as_deref().map(canonical_account_id),
            asset: params.asset.clone(),
            participant: params.wallet,
            limit: params.limit,
            offset: params.offset,
        };
        Ok(self.db.read(|conn| Ledger::new(conn, 0).entries(&filter))?)
    }

    pub fn transactions(&self, params: &GetLedgerTransactions) -> Result<Vec<LedgerTransaction>, RpcError> {
        let filter = TransactionFilter {
            account_id: params.account_id.as_deref().map(canonical_account_id),
            asset: params.asset.clone(),
            tx_type: params.tx_type,
            limit: params.limit,
            offset: params.offset,
        };
        Ok(self
            .db
            .read(|conn| Ledger::new(conn, 0).transactions(&filter))?)
    }

    pub fn channels(&self, params: &GetChannels) -> Result<Vec<ChannelInfo>, RpcError> {
        Ok(self
            .db
            .read(|conn| channels::list(conn, params.participant, params.status))?)
    }

    pub fn app_sessions(&self, params: &GetAppSessions) -> Result<Vec<AppSession>, RpcError> {
        Ok(self
            .db
            .read(|conn| app_session::list(conn, params.participant, params.status))?)
    }

    pub fn app_definition(&self, params: &GetAppDefinition) -> Result<AppDefinition, RpcError> {
        self.db
            .read(|conn| app_session::get(conn, params.app_session_id))?
            .map(|session| session.definition)
            .ok_or_else(|| RpcError::not_found(format!("app session {}", params.app_session_id)))
    }

    pub fn session_keys(&self, wallet: Address) -> Result<Vec<SessionKeyInfo>, RpcError> {
        let now = unix_secs();
        let infos = self.db.read(|conn| {
            session_keys::list(conn, wallet, now, false)?
                .into_iter()
                .map(|key| {
                    let allowances = session_keys::usage(conn, &key)?
                        .into_iter()
                        .map(|(allowance, used)| AllowanceUsage {
                            asset: allowance.asset,
                            allowance: allowance.amount,
                            used,
                        })
                        .collect();
                    Ok(SessionKeyInfo {
                        session_key: key.address,
                        application: key.application,
                        scope: key.scope,
                        allowances,
                        expires_at: key.expires_at,
                        created_at: key.created_at,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })?;
        Ok(infos)
    }

    pub fn rpc_history(&self, wallet: Address, params: &GetRpcHistory) -> Result<Vec<RpcRecord>, RpcError> {
        let limit = params.limit.unwrap_or(DEFAULT_HISTORY_PAGE);
        Ok(self
            .db
            .read(|conn| history::list(conn, wallet, limit, params.offset.unwrap_or(0)))?)
    }

    pub fn record_history(
        &self,
        wallet: Address,
        request: &RpcPayload,
        req_sig: &[Bytes],
        response: &str,
        res_sig: &[Bytes],
    ) {
        let result = self
            .db
            .with_transaction(|tx| history::record(tx, wallet, request, req_sig, response, res_sig));
        if let Err(e) = result {
            warn!(%wallet, method = %request.method, %e, "failed to record rpc history");
        }
    }

    pub async fn revoke_session_key(
        &self,
        signer: &Signer,
        params: &RevokeSessionKey,
    ) -> Result<Address, RpcError> {
        let _guard = self.locks.acquire([LockKey::Wallet(signer.wallet())]).await;
        let key = self.db.with_transaction(|tx| {
            session_keys::revoke(tx, signer, params.session_key, unix_secs())
        })?;
        Ok(key.address)
    }

    /// Moves unified balance from the signer's wallet to `destination`.
    pub async fn transfer(
        &self,
        signer: &Signer,
        params: &Transfer,
    ) -> Result<Vec<LedgerTransaction>, RpcError> {
        let from = signer.wallet();
        if params.destination == from {
            return Err(RpcError::validation("cannot transfer to yourself"));
        }
        if params.allocations.is_empty() {
            return Err(RpcError::validation("nothing to transfer"));
        }
        for allocation in &params.allocations {
            if self.config.asset_by_symbol(&allocation.asset).is_none() {
                return Err(RpcError::validation(format!(
                    "unsupported asset {}",
                    allocation.asset
                )));
            }
        }
        let _guard = self
            .locks
            .acquire([LockKey::Wallet(from), LockKey::Wallet(params.destination)])
            .await;
        let transactions = self.db.with_transaction(|tx| {
            ensure_no_pending_resize(tx, from)?;
            let ledger = Ledger::new(tx, unix_secs());
            params
                .allocations
                .iter()
                .filter(|allocation| !allocation.amount.is_zero())
                .map(|allocation| {
                    ledger.transfer(
                        TransactionType::Transfer,
                        &Posting::wallet(from),
                        &Posting::wallet(params.destination),
                        &allocation.asset,
                        allocation.amount,
                        signer.session_key(),
                    )
                })
                .collect::<Result<Vec<_>, RpcError>>()
        })?;
        info!(%from, to = %params.destination, count = transactions.len(), "transfer");
        for wallet in [from, params.destination] {
            self.notifier
                .notify(wallet, NotificationKind::Transfer, &json!({ "transactions": transactions }));
            self.notify_balances(wallet);
        }
        Ok(transactions)
    }

    pub async fn create_channel(
        &self,
        signer: &Signer,
        params: &CreateChannel,
    ) -> Result<SignedChannelState, RpcError> {
        let _guard = self.locks.acquire([LockKey::Wallet(signer.wallet())]).await;
        let ctx = self.ctx();
        self.db
            .with_transaction(|tx| channels::create_channel(tx, &ctx, signer, params))
    }

    pub async fn resize_channel(
        &self,
        signer: &Signer,
        params: &ResizeChannel,
    ) -> Result<SignedChannelState, RpcError> {
        self.channel_operation(signer, params.channel_id, |tx, ctx| {
            channels::resize_channel(tx, ctx, signer, params)
        })
        .await
    }

    pub async fn close_channel(
        &self,
        signer: &Signer,
        params: &CloseChannel,
    ) -> Result<SignedChannelState, RpcError> {
        self.channel_operation(signer, params.channel_id, |tx, ctx| {
            channels::close_channel(tx, ctx, signer, params)
        })
        .await
    }

    async fn channel_operation(
        &self,
        signer: &Signer,
        channel_id: ChannelId,
        f: impl FnOnce(&rusqlite::Connection, &Context) -> Result<SignedChannelState, RpcError>,
    ) -> Result<SignedChannelState, RpcError> {
        let wallet = signer.wallet();
        let _guard = self
            .locks
            .acquire([LockKey::Wallet(wallet), LockKey::Channel(channel_id)])
            .await;
        let ctx = self.ctx();
        let (signed, channel) = self.db.with_transaction(|tx| {
            let signed = f(tx, &ctx)?;
            Ok::<_, RpcError>((signed, channels::get(tx, channel_id)?))
        })?;
        if let Some(channel) = channel {
            self.notifier
                .notify(wallet, NotificationKind::ChannelUpdate, &channel);
        }
        self.notify_balances(wallet);
        Ok(signed)
    }

    pub async fn create_app_session(
        &self,
        signers: &[Signer],
        params: &CreateAppSession,
    ) -> Result<AppSession, RpcError> {
        let app_session_id = params.definition.session_id();
        let _guard = self
            .locks
            .acquire(session_locks(app_session_id, &params.definition))
            .await;
        let session = self.db.with_transaction(|tx| {
            app_session::create(tx, &self.config, unix_secs(), params, signers)
        })?;
        self.notify_app_session(&session);
        Ok(session)
    }

    pub async fn submit_app_state(
        &self,
        signers: &[Signer],
        params: &SubmitAppState,
    ) -> Result<AppSession, RpcError> {
        let definition = self.app_definition(&GetAppDefinition {
            app_session_id: params.app_session_id,
        })?;
        let _guard = self
            .locks
            .acquire(session_locks(params.app_session_id, &definition))
            .await;
        let session = self.db.with_transaction(|tx| {
            app_session::submit(tx, &self.config, unix_secs(), params, signers)
        })?;
        self.notify_app_session(&session);
        Ok(session)
    }

    pub async fn close_app_session(
        &self,
        signers: &[Signer],
        params: &CloseAppSession,
    ) -> Result<AppSession, RpcError> {
        let definition = self.app_definition(&GetAppDefinition {
            app_session_id: params.app_session_id,
        })?;
        let _guard = self
            .locks
            .acquire(session_locks(params.app_session_id, &definition))
            .await;
        let session = self.db.with_transaction(|tx| {
            app_session::close(tx, &self.config, unix_secs(), params, signers)
        })?;
        self.notify_app_session(&session);
        Ok(session)
    }

    fn notify_app_session(&self, session: &AppSession) {
        for participant in &session.definition.participants {
            self.notifier
                .notify(*participant, NotificationKind::AppSessionUpdate, session);
            self.notify_balances(*participant);
        }
    }

    fn notify_balances(&self, wallet: Address) {
        match self
            .db
            .read(|conn| Ledger::new(conn, 0).balance_list(&Account::wallet(wallet)))
        {
            Ok(balances) => self.notifier.notify(
                wallet,
                NotificationKind::BalanceUpdate,
                &json!({ "balance_updates": balances }),
            ),
            Err(e) => warn!(%wallet, %e, "failed to read balances for notification"),
        }
    }
}

fn session_locks(app_session_id: B256, definition: &AppDefinition) -> Vec<LockKey> {
    definition
        .participants
        .iter()
        .map(|p| LockKey::Wallet(*p))
        .chain([LockKey::AppSession(app_session_id)])
        .collect()
}

/// Parses an account id given by a client: a wallet address or an app session id.
fn parse_account(id: &str) -> Result<Account, RpcError> {
    if let Ok(address) = id.parse::<Address>() {
        return Ok(Account::wallet(address));
    }
    if let Ok(session_id) = id.parse::<B256>() {
        return Ok(Account::app_session(session_id));
    }
    Err(RpcError::validation(format!("invalid account id {id}")))
}

/// Account ids are stored in their canonical (checksummed) form. Ids which do not parse are matched as given.
fn canonical_account_id(id: &str) -> String {
    parse_account(id).map_or_else(|_| id.to_owned(), |account| account.id)
}
