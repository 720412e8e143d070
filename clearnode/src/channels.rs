//! Channels between a wallet and the broker, as the broker sees them.
//!
//! The broker co-signs the states a wallet needs to create, resize and close its channel, and reserves the funds
//! those states move in escrow. Nothing here changes the unified balance of a wallet until the settlement layer
//! confirms the transition: confirmed events flow in through [apply_log], the only place channel funds are released.

use std::{fmt, str::FromStr};

use alloy::primitives::{Address, B256, Bytes, I256, U256};
use anyhow::{Result, anyhow};
use custody::{
    ChannelRecord, CustodyEvent,
    chain::Log,
    crypto::SecretKey,
    state::{
        Allocation, BROKER, CREATOR, Channel, ChannelId, ChannelStatus as ChainStatus,
        ResizeAmounts, State, StateIntent,
    },
};
use rusqlite::{
    Connection, OptionalExtension, Row, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    cfg::{Amount, Config},
    db::{AddressSqlable, HashSqlable, from_json, mark_event_processed, to_json},
    error::RpcError,
    ledger::{Account, Ledger, Posting, TransactionType},
    serde_util::{num_as_str, rfc3339},
    session_keys::{self, Signer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Created on chain, waiting for the broker's deposit.
    Joining,
    Open,
    /// A broker-signed resize has not been confirmed yet. The channel's funds are frozen.
    Resizing,
    /// A broker-signed final state has not been confirmed yet.
    Closing,
    Challenged,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Joining => "joining",
            ChannelStatus::Open => "open",
            ChannelStatus::Resizing => "resizing",
            ChannelStatus::Closing => "closing",
            ChannelStatus::Challenged => "challenged",
            ChannelStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "joining" => ChannelStatus::Joining,
            "open" => ChannelStatus::Open,
            "resizing" => ChannelStatus::Resizing,
            "closing" => ChannelStatus::Closing,
            "challenged" => ChannelStatus::Challenged,
            "closed" => ChannelStatus::Closed,
            other => return Err(anyhow!("unknown channel status {other}")),
        })
    }
}

impl ToSql for ChannelStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ChannelStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        ChannelStatus::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    /// The wallet whose unified balance the channel backs.
    pub wallet: Address,
    /// The creator on chain. A session key rather than `wallet` for legacy channels.
    pub participant: Address,
    pub token: Address,
    pub asset: String,
    /// The creator's allocation in the latest confirmed state.
    pub amount: Amount,
    pub status: ChannelStatus,
    pub version: u64,
    pub legacy: bool,
    pub challenge_expiry: u64,
    pub pending_resize: Option<ResizeAmounts>,
    pub definition: Channel,
    /// The latest state confirmed on chain.
    pub state: State,
    #[serde(with = "rfc3339")]
    pub created_at: u64,
    #[serde(with = "rfc3339")]
    pub updated_at: u64,
}

impl ChannelInfo {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let json_error = |index: usize| {
            move |e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            }
        };
        let pending_resize: Option<String> = row.get(10)?;
        let definition: String = row.get(11)?;
        let state: String = row.get(12)?;
        Ok(ChannelInfo {
            channel_id: row.get::<_, HashSqlable>(0)?.into(),
            wallet: row.get::<_, AddressSqlable>(1)?.into(),
            participant: row.get::<_, AddressSqlable>(2)?.into(),
            token: row.get::<_, AddressSqlable>(3)?.into(),
            asset: row.get(4)?,
            amount: row.get(5)?,
            status: row.get(6)?,
            version: row.get(7)?,
            legacy: row.get(8)?,
            challenge_expiry: row.get(9)?,
            pending_resize: pending_resize
                .map(|json| from_json(&json))
                .transpose()
                .map_err(json_error(10))?,
            definition: from_json(&definition).map_err(json_error(11))?,
            state: from_json(&state).map_err(json_error(12))?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

const SELECT_CHANNEL: &str = "SELECT channel_id, wallet, participant, token, asset, amount, status, version, legacy,
    challenge_expiry, pending_resize, definition, state, created_at, updated_at FROM channels";

pub fn get(conn: &Connection, channel_id: ChannelId) -> Result<Option<ChannelInfo>> {
    Ok(conn
        .query_row(
            &format!("{SELECT_CHANNEL} WHERE channel_id = ?1"),
            [HashSqlable(channel_id)],
            ChannelInfo::from_row,
        )
        .optional()?)
}

/// Channels, newest first, optionally filtered by wallet and status.
pub fn list(
    conn: &Connection,
    wallet: Option<Address>,
    status: Option<ChannelStatus>,
) -> Result<Vec<ChannelInfo>> {
    let mut statement = conn.prepare_cached(&format!(
        "{SELECT_CHANNEL} WHERE (?1 IS NULL OR wallet = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, channel_id"
    ))?;
    let channels = statement
        .query_map(params![wallet.map(AddressSqlable), status], ChannelInfo::from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(channels)
}

/// Whether any channel of `wallet` has a resize awaiting confirmation. While one does, the wallet's unified balance
/// is frozen.
pub fn has_pending_resize(conn: &Connection, wallet: Address) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM channels WHERE wallet = ?1 AND status = ?2)",
        params![AddressSqlable(wallet), ChannelStatus::Resizing],
        |row| row.get(0),
    )?)
}

pub fn ensure_no_pending_resize(conn: &Connection, wallet: Address) -> Result<(), RpcError> {
    if has_pending_resize(conn, wallet)? {
        return Err(RpcError::state_conflict(format!(
            "a resize of a channel of {wallet} is awaiting confirmation"
        )));
    }
    Ok(())
}

fn insert(conn: &Connection, channel: &ChannelInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO channels (channel_id, wallet, participant, token, asset, amount, status, version, legacy,
            challenge_expiry, pending_resize, definition, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            HashSqlable(channel.channel_id),
            AddressSqlable(channel.wallet),
            AddressSqlable(channel.participant),
            AddressSqlable(channel.token),
            channel.asset,
            channel.amount,
            channel.status,
            channel.version,
            channel.legacy,
            channel.challenge_expiry,
            channel.pending_resize.as_ref().map(to_json).transpose()?,
            to_json(&channel.definition)?,
            to_json(&channel.state)?,
            channel.created_at,
            channel.updated_at,
        ],
    )?;
    Ok(())
}

fn save(conn: &Connection, channel: &ChannelInfo) -> Result<()> {
    conn.execute(
        "UPDATE channels SET amount = ?2, status = ?3, version = ?4, challenge_expiry = ?5, pending_resize = ?6,
            state = ?7, updated_at = ?8
         WHERE channel_id = ?1",
        params![
            HashSqlable(channel.channel_id),
            channel.amount,
            channel.status,
            channel.version,
            channel.challenge_expiry,
            channel.pending_resize.as_ref().map(to_json).transpose()?,
            to_json(&channel.state)?,
            channel.updated_at,
        ],
    )?;
    Ok(())
}

/// What a broker-side channel operation needs to know.
pub struct Context<'a> {
    pub config: &'a Config,
    pub broker: &'a SecretKey,
    pub now: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannel {
    pub chain_id: u64,
    pub token: Address,
    /// The creator's deposit.
    #[serde(default)]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeChannel {
    pub channel_id: ChannelId,
    /// Moves funds from (positive) or to (negative) the creator's custody balance.
    #[serde(default, with = "num_as_str")]
    pub resize_amount: i128,
    /// Moves funds from (positive) or to (negative) the wallet's unified balance.
    #[serde(default, with = "num_as_str")]
    pub allocate_amount: i128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
    /// Receives the creator's final allocation. Defaults to the wallet. Only the wallet itself may choose another
    /// destination.
    #[serde(default)]
    pub funds_destination: Option<Address>,
}

/// A state co-signed by the broker, ready for the wallet to countersign and submit on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedChannelState {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    pub state: State,
    pub server_signature: Bytes,
}

fn signed(channel_id: ChannelId, channel: Option<Channel>, mut state: State, broker: &SecretKey) -> SignedChannelState {
    state.sign(broker, channel_id, BROKER);
    let server_signature = state.sigs[&BROKER].clone();
    SignedChannelState {
        channel_id,
        channel,
        state,
        server_signature,
    }
}

/// Prepares a channel between the signer's wallet and the broker. Nothing is stored until the channel is created on
/// chain.
pub fn create_channel(
    conn: &Connection,
    ctx: &Context,
    signer: &Signer,
    params: &CreateChannel,
) -> Result<SignedChannelState, RpcError> {
    if params.chain_id != ctx.config.chain.chain_id {
        return Err(RpcError::validation(format!(
            "unsupported chain {}",
            params.chain_id
        )));
    }
    if ctx.config.asset_by_token(params.token).is_none() {
        return Err(RpcError::validation(format!(
            "unsupported token {}",
            params.token
        )));
    }
    let wallet = signer.wallet();
    let existing = list(conn, Some(wallet), None)?
        .into_iter()
        .any(|c| c.token == params.token && c.status != ChannelStatus::Closed);
    if existing {
        return Err(RpcError::validation(format!(
            "{wallet} already has a channel for token {}",
            params.token
        )));
    }

    let broker = ctx.broker.address();
    let channel = Channel {
        participants: vec![wallet, broker],
        adjudicator: ctx.config.chain.adjudicator_address,
        challenge: ctx.config.chain.challenge_period,
        nonce: rand::random(),
    };
    let channel_id = channel.id(ctx.config.chain.chain_id);
    let initial = State::new(
        StateIntent::Initialize,
        0,
        Bytes::new(),
        vec![
            Allocation::new(wallet, params.token, params.amount.to_u256()),
            Allocation::new(broker, params.token, U256::ZERO),
        ],
    );
    info!(%channel_id, %wallet, amount = %params.amount, "channel prepared");
    Ok(signed(channel_id, Some(channel), initial, ctx.broker))
}

fn owned_channel(conn: &Connection, signer: &Signer, channel_id: ChannelId) -> Result<ChannelInfo, RpcError> {
    let channel = get(conn, channel_id)?
        .ok_or_else(|| RpcError::not_found(format!("channel {channel_id}")))?;
    if channel.wallet != signer.wallet() {
        return Err(RpcError::authentication(format!(
            "channel {channel_id} does not belong to {}",
            signer.wallet()
        )));
    }
    Ok(channel)
}

fn to_i256(value: i128) -> I256 {
    I256::try_from(value).unwrap_or(I256::ZERO)
}

/// Co-signs a RESIZE state moving funds between chain, channel and unified balance. Funds leaving the unified balance
/// are reserved in escrow until the resize is confirmed.
pub fn resize_channel(
    conn: &Connection,
    ctx: &Context,
    signer: &Signer,
    params: &ResizeChannel,
) -> Result<SignedChannelState, RpcError> {
    let mut channel = owned_channel(conn, signer, params.channel_id)?;
    match channel.status {
        ChannelStatus::Open => {}
        ChannelStatus::Resizing => {
            return Err(RpcError::state_conflict(format!(
                "a resize of channel {} is already pending",
                channel.channel_id
            )));
        }
        status => {
            return Err(RpcError::validation(format!(
                "channel {} is {status}",
                channel.channel_id
            )));
        }
    }
    let amounts = ResizeAmounts::new(to_i256(params.resize_amount), to_i256(params.allocate_amount));
    if !amounts.has_opposite_signs() {
        return Err(RpcError::validation(
            "resize_amount and allocate_amount must be non-zero with opposite signs",
        ));
    }
    if params.resize_amount.checked_add(params.allocate_amount).is_none_or(|sum| sum < 0) {
        return Err(RpcError::validation(
            "allocate_amount must not exceed the funds leaving the channel",
        ));
    }
    let delta = Amount(params.resize_amount.unsigned_abs());
    let new_amount = if params.resize_amount >= 0 {
        channel.amount.checked_add(delta)
    } else {
        channel.amount.checked_sub(delta)
    }
    .ok_or_else(|| RpcError::validation("channel amount would be negative"))?;
    if channel.legacy && !new_amount.is_zero() {
        return Err(RpcError::validation(
            "legacy channels may only be resized to zero",
        ));
    }

    let ledger = Ledger::new(conn, ctx.now);
    if params.allocate_amount > 0 {
        ensure_no_pending_resize(conn, channel.wallet)?;
        ledger.transfer(
            TransactionType::EscrowLock,
            &Posting::wallet(channel.wallet),
            &Posting::escrow(channel.channel_id, channel.wallet),
            &channel.asset,
            Amount(params.allocate_amount.unsigned_abs()),
            signer.session_key(),
        )?;
    }

    let mut allocations = channel.state.allocations.clone();
    allocations[CREATOR].amount = new_amount.to_u256();
    let candidate = State::new(
        StateIntent::Resize,
        channel.version + 1,
        amounts.encode(),
        allocations,
    );
    channel.status = ChannelStatus::Resizing;
    channel.pending_resize = Some(amounts);
    channel.updated_at = ctx.now;
    save(conn, &channel)?;
    info!(
        channel_id = %channel.channel_id,
        resize = params.resize_amount,
        allocate = params.allocate_amount,
        "channel resize signed"
    );
    Ok(signed(channel.channel_id, None, candidate, ctx.broker))
}

/// Co-signs a FINALIZE state. The creator is allocated as much of the channel as its unified balance covers and the
/// broker the rest.
///
/// Closing a channel with a pending resize abandons the resize. The FINALIZE then skips the resize's version, so
/// either state may still reach the chain first.
pub fn close_channel(
    conn: &Connection,
    ctx: &Context,
    signer: &Signer,
    params: &CloseChannel,
) -> Result<SignedChannelState, RpcError> {
    let mut channel = owned_channel(conn, signer, params.channel_id)?;
    let ledger = Ledger::new(conn, ctx.now);
    let version = match channel.status {
        ChannelStatus::Open => channel.version + 1,
        ChannelStatus::Resizing => {
            // The resize's reservation goes back to the wallet until the chain settles one state or the other.
            release_escrow(&ledger, &channel)?;
            channel.pending_resize = None;
            channel.version + 2
        }
        ChannelStatus::Closing => {
            return Err(RpcError::state_conflict(format!(
                "channel {} is already closing",
                channel.channel_id
            )));
        }
        status => {
            return Err(RpcError::validation(format!(
                "channel {} is {status}",
                channel.channel_id
            )));
        }
    };
    let destination = params.funds_destination.unwrap_or(channel.wallet);
    if destination != channel.wallet && !matches!(signer, Signer::Wallet(_)) {
        return Err(RpcError::authentication(
            "only the wallet may close to another destination",
        ));
    }

    let balance = ledger.balance(&Account::wallet(channel.wallet), &channel.asset)?;
    let creator_amount = balance.min(channel.amount);
    let broker_amount = channel.amount.saturating_sub(creator_amount);
    if !creator_amount.is_zero() {
        ledger.transfer(
            TransactionType::EscrowLock,
            &Posting::wallet(channel.wallet),
            &Posting::escrow(channel.channel_id, channel.wallet),
            &channel.asset,
            creator_amount,
            None,
        )?;
    }
    let candidate = State::new(
        StateIntent::Finalize,
        version,
        Bytes::new(),
        vec![
            Allocation::new(destination, channel.token, creator_amount.to_u256()),
            Allocation::new(
                ctx.broker.address(),
                channel.token,
                broker_amount.to_u256(),
            ),
        ],
    );
    channel.status = ChannelStatus::Closing;
    channel.updated_at = ctx.now;
    save(conn, &channel)?;
    info!(channel_id = %channel.channel_id, %creator_amount, %broker_amount, "channel close signed");
    Ok(signed(channel.channel_id, None, candidate, ctx.broker))
}

/// Returns everything held in the channel's escrow to its wallet.
fn release_escrow(ledger: &Ledger, channel: &ChannelInfo) -> Result<Amount, RpcError> {
    let escrow = Posting::escrow(channel.channel_id, channel.wallet);
    let held = ledger.balance(&escrow.account, &channel.asset)?;
    if !held.is_zero() {
        ledger.transfer(
            TransactionType::EscrowUnlock,
            &escrow,
            &Posting::wallet(channel.wallet),
            &channel.asset,
            held,
            None,
        )?;
    }
    Ok(held)
}

/// A transaction the broker should send once an event has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Join a channel the wallet created without the broker's signature.
    Join { channel_id: ChannelId, state: State },
    /// Answer a challenge with a newer mutually signed state.
    Checkpoint { channel_id: ChannelId, state: State },
}

impl FollowUp {
    /// The signature the broker joins `state` with.
    pub fn join_signature(broker: &SecretKey, channel_id: ChannelId, state: &State) -> Bytes {
        broker.sign_hash(state.hash(channel_id))
    }
}

/// The effects of applying one event.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    pub follow_ups: Vec<FollowUp>,
    /// Wallets whose unified balance may have changed.
    pub wallets: Vec<Address>,
    /// The channel after the event, if the broker tracks it.
    pub channel: Option<ChannelInfo>,
}

/// Applies one confirmed custody event to the ledger and the channel store. Each event is applied at most once,
/// however often it is replayed.
pub fn apply_log(
    conn: &Connection,
    config: &Config,
    broker: Address,
    log: &Log,
    now: u64,
) -> Result<Applied, RpcError> {
    if !mark_event_processed(conn, log.tx_hash, log.log_index, log.block_number)? {
        debug!(tx_hash = %log.tx_hash, log_index = log.log_index, "event already processed");
        return Ok(Applied::default());
    }
    let ledger = Ledger::new(conn, now);
    match &log.event {
        CustodyEvent::Created {
            channel_id,
            wallet: creator,
            channel,
            initial,
        } => on_created(conn, config, broker, &ledger, log, *channel_id, *creator, channel, initial),
        CustodyEvent::Deposited {
            wallet,
            token,
            amount,
        } => {
            let Some(asset) = config.asset_by_token(*token) else {
                return Ok(Applied::default());
            };
            ledger.credit(&Posting::custody(*wallet), &asset.symbol, Amount::from_u256(*amount)?)?;
            Ok(Applied::default())
        }
        CustodyEvent::Withdrawn {
            wallet,
            token,
            amount,
        } => {
            let Some(asset) = config.asset_by_token(*token) else {
                return Ok(Applied::default());
            };
            debit_bounded(
                &ledger,
                &Posting::custody(*wallet),
                &asset.symbol,
                Amount::from_u256(*amount)?,
            )?;
            Ok(Applied::default())
        }
        event => {
            let Some(channel_id) = event.channel_id() else {
                return Ok(Applied::default());
            };
            let Some(mut channel) = get(conn, channel_id)? else {
                debug!(%channel_id, "event for untracked channel");
                return Ok(Applied::default());
            };
            let follow_ups = on_channel_event(&ledger, &mut channel, event)?;
            channel.updated_at = now;
            save(conn, &channel)?;
            Ok(Applied {
                follow_ups,
                wallets: vec![channel.wallet],
                channel: Some(channel),
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn on_created(
    conn: &Connection,
    config: &Config,
    broker: Address,
    ledger: &Ledger,
    log: &Log,
    channel_id: ChannelId,
    creator: Address,
    definition: &Channel,
    initial: &State,
) -> Result<Applied, RpcError> {
    if definition.participants.get(BROKER) != Some(&broker) {
        return Ok(Applied::default());
    }
    if get(conn, channel_id)?.is_some() {
        return Err(RpcError::ChainReconciliation(format!(
            "channel {channel_id} created twice"
        )));
    }
    if definition.adjudicator != config.chain.adjudicator_address
        || definition.challenge != config.chain.challenge_period
    {
        warn!(
            %channel_id,
            adjudicator = %definition.adjudicator,
            challenge = definition.challenge,
            "ignoring channel with foreign adjudicator or challenge period"
        );
        return Ok(Applied::default());
    }
    // A creator that is a registered session key marks a channel opened under the old signer model. The key must have
    // been live before the channel appeared on chain.
    let (legacy, wallet) = match session_keys::get(conn, creator)? {
        Some(key) if key.is_active(ledger.now()) && key.registered_block < log.block_number => {
            (true, key.wallet)
        }
        Some(key) => {
            warn!(
                %channel_id,
                %creator,
                wallet = %key.wallet,
                "ignoring channel of an inactive or later session key"
            );
            return Ok(Applied::default());
        }
        None => (false, creator),
    };
    if legacy
        && config
            .auth
            .legacy_channel_cutoff_block
            .is_some_and(|cutoff| log.block_number > cutoff)
    {
        warn!(%channel_id, %creator, "ignoring channel created by a session key after the cutoff");
        return Ok(Applied::default());
    }
    let [creator_allocation, broker_allocation] = &initial.allocations[..] else {
        warn!(%channel_id, "ignoring channel with unexpected allocations");
        return Ok(Applied::default());
    };
    if !broker_allocation.amount.is_zero() {
        warn!(%channel_id, "ignoring channel expecting a broker deposit");
        return Ok(Applied::default());
    }
    let Some(asset) = config.asset_by_token(creator_allocation.token) else {
        warn!(%channel_id, token = %creator_allocation.token, "ignoring channel of unsupported token");
        return Ok(Applied::default());
    };
    let amount = Amount::from_u256(creator_allocation.amount)?;
    debit_bounded(ledger, &Posting::custody(creator), &asset.symbol, amount)?;

    let channel = ChannelInfo {
        channel_id,
        wallet,
        participant: creator,
        token: creator_allocation.token,
        asset: asset.symbol.clone(),
        amount,
        status: ChannelStatus::Joining,
        version: 0,
        legacy,
        challenge_expiry: 0,
        pending_resize: None,
        definition: definition.clone(),
        state: initial.clone(),
        created_at: ledger.now(),
        updated_at: ledger.now(),
    };
    insert(conn, &channel)?;
    info!(%channel_id, %wallet, legacy, %amount, "channel created");

    let follow_ups = if initial.signature(BROKER).is_none() {
        vec![FollowUp::Join {
            channel_id,
            state: initial.clone(),
        }]
    } else {
        vec![]
    };
    Ok(Applied {
        follow_ups,
        wallets: vec![wallet],
        channel: Some(channel),
    })
}

fn on_channel_event(
    ledger: &Ledger,
    channel: &mut ChannelInfo,
    event: &CustodyEvent,
) -> Result<Vec<FollowUp>, RpcError> {
    let channel_id = channel.channel_id;
    let status = channel.status;
    let inconsistent = |what: &str| {
        RpcError::ChainReconciliation(format!(
            "{what} for channel {channel_id} in status {status}"
        ))
    };
    let mut follow_ups = Vec::new();
    match event {
        CustodyEvent::Joined { index, .. } => {
            if *index == BROKER {
                let deposit = Amount::from_u256(channel.state.allocations[BROKER].amount)?;
                debit_bounded(
                    ledger,
                    &Posting::custody(channel.definition.participants[BROKER]),
                    &channel.asset,
                    deposit,
                )?;
            }
            debug!(%channel_id, index, "channel joined");
        }
        CustodyEvent::Opened { .. } => {
            if channel.status != ChannelStatus::Joining {
                return Err(inconsistent("opened"));
            }
            credit_wallet(ledger, channel, channel.amount)?;
            channel.status = ChannelStatus::Open;
            info!(%channel_id, amount = %channel.amount, "channel opened");
        }
        CustodyEvent::Resized { amounts, state, .. } => {
            match channel.status {
                ChannelStatus::Open | ChannelStatus::Resizing => {}
                ChannelStatus::Closing => {
                    // An abandoned resize landed first. The signed close no longer matches the channel's funds.
                    release_escrow(ledger, channel)?;
                    warn!(
                        %channel_id,
                        version = state.version,
                        "resize confirmed while closing, close must be signed again"
                    );
                }
                _ => return Err(inconsistent("resized")),
            }
            let resize = amounts.resize_amount;
            let resize_abs = Amount::from_u256(resize.unsigned_abs())?;
            if resize.is_positive() {
                debit_bounded(ledger, &Posting::custody(channel.participant), &channel.asset, resize_abs)?;
            } else {
                let destination = state.allocations[CREATOR].destination;
                ledger.credit(&Posting::custody(destination), &channel.asset, resize_abs)?;
            }
            let allocate = amounts.allocate_amount;
            let allocate_abs = Amount::from_u256(allocate.unsigned_abs())?;
            if allocate.is_negative() {
                credit_wallet(ledger, channel, allocate_abs)?;
            } else if allocate.is_positive() {
                settle_from_escrow(ledger, channel, allocate_abs)?;
            }
            // Anything still reserved belonged to a different resize than the one confirmed.
            release_escrow(ledger, channel)?;
            channel.amount = Amount::from_u256(state.allocations[CREATOR].amount)?;
            channel.version = state.version;
            channel.state = state.clone();
            channel.status = ChannelStatus::Open;
            channel.pending_resize = None;
            info!(%channel_id, version = state.version, amount = %channel.amount, "channel resized");
        }
        CustodyEvent::Challenged {
            state, expiration, ..
        } => {
            if channel.status == ChannelStatus::Closed {
                return Err(inconsistent("challenged"));
            }
            let held = &channel.state;
            if held.version > state.version
                && held.signature(CREATOR).is_some()
                && held.signature(BROKER).is_some()
            {
                follow_ups.push(FollowUp::Checkpoint {
                    channel_id,
                    state: held.clone(),
                });
            } else {
                channel.version = state.version;
                channel.state = state.clone();
            }
            channel.status = ChannelStatus::Challenged;
            channel.challenge_expiry = *expiration;
            warn!(%channel_id, version = state.version, expiration, "channel challenged");
        }
        CustodyEvent::Checkpointed { state, .. } => {
            if state.version > channel.version {
                channel.version = state.version;
                channel.state = state.clone();
            }
            if channel.status == ChannelStatus::Challenged {
                channel.status = ChannelStatus::Open;
            }
            channel.challenge_expiry = 0;
            info!(%channel_id, version = state.version, "channel checkpointed");
        }
        CustodyEvent::Closed { state, .. } => {
            match channel.status {
                ChannelStatus::Closed => return Err(inconsistent("closed")),
                ChannelStatus::Joining => {
                    // Never opened: the custody refunded the creator's deposit.
                    ledger.credit(&Posting::custody(channel.participant), &channel.asset, channel.amount)?;
                }
                _ => {
                    let creator_amount = Amount::from_u256(state.allocations[CREATOR].amount)?;
                    settle_from_escrow(ledger, channel, creator_amount)?;
                    release_escrow(ledger, channel)?;
                    for allocation in &state.allocations {
                        ledger.credit(
                            &Posting::custody(allocation.destination),
                            &channel.asset,
                            Amount::from_u256(allocation.amount)?,
                        )?;
                    }
                }
            }
            channel.version = state.version;
            channel.state = state.clone();
            channel.status = ChannelStatus::Closed;
            channel.challenge_expiry = 0;
            channel.pending_resize = None;
            info!(%channel_id, version = state.version, "channel closed");
        }
        CustodyEvent::Created { .. } | CustodyEvent::Deposited { .. } | CustodyEvent::Withdrawn { .. } => {}
    }
    Ok(follow_ups)
}

/// Credits channel funds arriving in the unified balance.
fn credit_wallet(ledger: &Ledger, channel: &ChannelInfo, amount: Amount) -> Result<(), RpcError> {
    if amount.is_zero() {
        return Ok(());
    }
    ledger.credit(&Posting::wallet(channel.wallet), &channel.asset, amount)?;
    ledger.record_transaction(
        TransactionType::Deposit,
        &Account::custody(channel.participant),
        &Account::wallet(channel.wallet),
        &channel.asset,
        amount,
    )?;
    Ok(())
}

/// Takes `amount` leaving the unified balance for the chain out of the channel's escrow, and out of the wallet for
/// whatever the escrow does not cover.
fn settle_from_escrow(ledger: &Ledger, channel: &ChannelInfo, amount: Amount) -> Result<(), RpcError> {
    if amount.is_zero() {
        return Ok(());
    }
    let escrow = Posting::escrow(channel.channel_id, channel.wallet);
    let held = ledger.balance(&escrow.account, &channel.asset)?;
    let from_escrow = held.min(amount);
    ledger.debit(&escrow, &channel.asset, from_escrow, None)?;
    let shortfall = amount.saturating_sub(from_escrow);
    if !shortfall.is_zero() {
        debit_bounded(ledger, &Posting::wallet(channel.wallet), &channel.asset, shortfall)?;
    }
    ledger.record_transaction(
        TransactionType::Withdrawal,
        &Account::wallet(channel.wallet),
        &Account::custody(channel.participant),
        &channel.asset,
        amount,
    )?;
    Ok(())
}

/// Debits as much of `amount` as the account holds. The chain is authoritative, so a shortfall is logged rather than
/// refused.
fn debit_bounded(ledger: &Ledger, from: &Posting, asset: &str, amount: Amount) -> Result<Amount, RpcError> {
    let balance = ledger.balance(&from.account, asset)?;
    let taken = balance.min(amount);
    ledger.debit(from, asset, taken, None)?;
    if taken < amount {
        warn!(account = %from.account, asset, %amount, %taken, "ledger short of confirmed on-chain debit");
    }
    Ok(taken)
}

/// Overwrites the broker's view of a channel with what the chain holds.
pub fn resync(
    conn: &Connection,
    channel_id: ChannelId,
    record: Option<&ChannelRecord>,
    now: u64,
) -> Result<Option<ChannelInfo>> {
    let Some(mut channel) = get(conn, channel_id)? else {
        return Ok(None);
    };
    match record {
        None => channel.status = ChannelStatus::Closed,
        Some(record) => {
            channel.status = match record.status {
                ChainStatus::Initial => ChannelStatus::Joining,
                ChainStatus::Active => match channel.status {
                    ChannelStatus::Resizing | ChannelStatus::Closing => channel.status,
                    _ => ChannelStatus::Open,
                },
                ChainStatus::Dispute => ChannelStatus::Challenged,
                ChainStatus::Void | ChainStatus::Final => ChannelStatus::Closed,
            };
            channel.challenge_expiry = record.challenge_expiry;
            channel.version = record.version();
            channel.state = record.last_valid_state.clone();
            if let Some(allocation) = record.last_valid_state.allocations.get(CREATOR) {
                channel.amount = Amount::from_u256(allocation.amount)?;
            }
        }
    }
    channel.updated_at = now;
    save(conn, &channel)?;
    warn!(%channel_id, status = %channel.status, version = channel.version, "channel resynchronized from chain");
    Ok(Some(channel))
}

/// Parses a channel id given as hex.
pub fn parse_channel_id(s: &str) -> Result<ChannelId, RpcError> {
    B256::from_str(s).map_err(|_| RpcError::validation(format!("invalid channel id {s}")))
}
