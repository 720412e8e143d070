//! The custody state machine: escrows funds for two-party channels and settles them from signed states.
//!
//! Every operation either succeeds with the events it emitted or fails with a [CustodyError] and no effect at all.
//! Validation always completes before the first mutation.

use std::{collections::BTreeMap, sync::Arc};

use alloy::{
    primitives::{Address, B256, Bytes, I256, U256},
    sol_types::Eip712Domain,
};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    adjudicator::{self, Adjudicator, Context, Registry},
    error::CustodyError,
    evm::ScratchEvm,
    sigverify::{self, NO_EIP712_SUPPORT, SignedPayload},
    state::{
        Allocation, BROKER, CREATOR, Channel, ChannelId, ChannelStatus, PARTICIPANTS,
        ResizeAmounts, State, StateIntent,
    },
};

type Result<T, E = CustodyError> = std::result::Result<T, E>;

pub const EIP712_DOMAIN_NAME: &str = "Custody";
pub const EIP712_DOMAIN_VERSION: &str = "0.3.0";
/// Upper bound on a channel's challenge period, in seconds.
pub const MAX_CHALLENGE_PERIOD: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    pub chain_id: u64,
    /// Address the custody is deployed at. Part of the EIP-712 domain.
    pub address: Address,
    /// Lower bound on a channel's challenge period, in seconds.
    pub min_challenge_period: u64,
    /// Whether EIP-712 typed state signatures are accepted.
    pub eip712: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustodyEvent {
    Created {
        channel_id: ChannelId,
        wallet: Address,
        channel: Channel,
        initial: State,
    },
    Joined {
        channel_id: ChannelId,
        index: usize,
    },
    Opened {
        channel_id: ChannelId,
    },
    Challenged {
        channel_id: ChannelId,
        state: State,
        expiration: u64,
    },
    Checkpointed {
        channel_id: ChannelId,
        state: State,
    },
    Resized {
        channel_id: ChannelId,
        amounts: ResizeAmounts,
        state: State,
    },
    Closed {
        channel_id: ChannelId,
        state: State,
    },
    Deposited {
        wallet: Address,
        token: Address,
        amount: U256,
    },
    Withdrawn {
        wallet: Address,
        token: Address,
        amount: U256,
    },
}

impl CustodyEvent {
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            CustodyEvent::Created { channel_id, .. }
            | CustodyEvent::Joined { channel_id, .. }
            | CustodyEvent::Opened { channel_id }
            | CustodyEvent::Challenged { channel_id, .. }
            | CustodyEvent::Checkpointed { channel_id, .. }
            | CustodyEvent::Resized { channel_id, .. }
            | CustodyEvent::Closed { channel_id, .. } => Some(*channel_id),
            CustodyEvent::Deposited { .. } | CustodyEvent::Withdrawn { .. } => None,
        }
    }
}

/// What the custody knows about a live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: Channel,
    pub status: ChannelStatus,
    pub last_valid_state: State,
    /// Block timestamp after which a disputed channel may be closed unilaterally. Zero outside of disputes.
    pub challenge_expiry: u64,
    pub expected_deposits: Vec<Allocation>,
    pub actual_deposits: Vec<Allocation>,
    /// Which participants have locked their deposit, zero deposits included.
    pub joined: Vec<bool>,
    /// Funds currently escrowed by the channel, per token.
    pub locked: BTreeMap<Address, U256>,
}

impl ChannelRecord {
    pub fn version(&self) -> u64 {
        self.last_valid_state.version
    }

    fn is_funded(&self) -> bool {
        self.joined.iter().all(|joined| *joined)
    }
}

#[derive(Debug, Clone)]
pub struct Custody {
    config: CustodyConfig,
    domain_separator: B256,
    adjudicators: Registry,
    contracts: ScratchEvm,
    channels: BTreeMap<ChannelId, ChannelRecord>,
    available: BTreeMap<(Address, Address), U256>,
}

impl Custody {
    pub fn new(config: CustodyConfig) -> Self {
        let domain_separator = if config.eip712 {
            Eip712Domain::new(
                Some(EIP712_DOMAIN_NAME.into()),
                Some(EIP712_DOMAIN_VERSION.into()),
                Some(U256::from(config.chain_id)),
                Some(config.address),
                None,
            )
            .separator()
        } else {
            *NO_EIP712_SUPPORT
        };
        Custody {
            config,
            domain_separator,
            adjudicators: Registry::new(),
            contracts: ScratchEvm::new(),
            channels: BTreeMap::new(),
            available: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CustodyConfig {
        &self.config
    }

    pub fn domain_separator(&self) -> B256 {
        self.domain_separator
    }

    pub fn register_adjudicator(&mut self, address: Address, adjudicator: Arc<dyn Adjudicator>) {
        self.adjudicators.register(address, adjudicator);
    }

    /// Contract code visible to the contract-wallet signature schemes.
    pub fn contracts_mut(&mut self) -> &mut ScratchEvm {
        &mut self.contracts
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<&ChannelRecord> {
        self.channels.get(&channel_id)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, &ChannelRecord)> {
        self.channels.iter()
    }

    pub fn available(&self, account: Address, token: Address) -> U256 {
        self.available
            .get(&(account, token))
            .copied()
            .unwrap_or_default()
    }

    pub fn create(&mut self, channel: Channel, initial: State) -> Result<Vec<CustodyEvent>> {
        if channel.participants.len() != PARTICIPANTS {
            return Err(CustodyError::InvalidParticipants {
                expected: PARTICIPANTS,
                actual: channel.participants.len(),
            });
        }
        if channel.participants[CREATOR] == channel.participants[BROKER] {
            return Err(CustodyError::InvalidParticipants {
                expected: PARTICIPANTS,
                actual: 1,
            });
        }
        if channel.challenge < self.config.min_challenge_period
            || channel.challenge > MAX_CHALLENGE_PERIOD
        {
            return Err(CustodyError::InvalidChallengePeriod(channel.challenge));
        }
        self.adjudicator(&channel)?;
        let channel_id = channel.id(self.config.chain_id);
        if self.channels.contains_key(&channel_id) {
            return Err(CustodyError::ChannelExists(channel_id));
        }
        if initial.intent != StateIntent::Initialize {
            return Err(CustodyError::InvalidIntent {
                expected: StateIntent::Initialize,
                actual: initial.intent,
            });
        }
        if initial.version != 0 {
            return Err(CustodyError::InvalidVersion {
                expected: "0".to_owned(),
                actual: initial.version,
            });
        }
        if initial.allocations.len() != PARTICIPANTS {
            return Err(CustodyError::InvalidAllocations);
        }
        if !self.is_signed_by(&channel, channel_id, &initial, CREATOR) {
            return Err(CustodyError::InvalidSignature(CREATOR));
        }
        let broker_signed = initial.signature(BROKER).is_some();
        if broker_signed && !self.is_signed_by(&channel, channel_id, &initial, BROKER) {
            return Err(CustodyError::InvalidSignature(BROKER));
        }

        let joining: &[usize] = if broker_signed {
            &[CREATOR, BROKER]
        } else {
            &[CREATOR]
        };
        for index in joining {
            let allocation = &initial.allocations[*index];
            self.ensure_available(
                channel.participants[*index],
                allocation.token,
                allocation.amount,
            )?;
        }

        let mut record = ChannelRecord {
            channel: channel.clone(),
            status: ChannelStatus::Initial,
            last_valid_state: initial.clone(),
            challenge_expiry: 0,
            expected_deposits: initial.allocations.clone(),
            actual_deposits: initial
                .allocations
                .iter()
                .map(|a| Allocation::new(a.destination, a.token, U256::ZERO))
                .collect(),
            joined: vec![false; PARTICIPANTS],
            locked: initial
                .allocations
                .iter()
                .map(|a| (a.token, U256::ZERO))
                .collect(),
        };
        for index in joining {
            self.lock_deposit(&mut record, *index);
        }

        let mut events = vec![CustodyEvent::Created {
            channel_id,
            wallet: channel.participants[CREATOR],
            channel,
            initial,
        }];
        if record.is_funded() {
            record.status = ChannelStatus::Active;
            events.push(CustodyEvent::Opened { channel_id });
        }
        info!(%channel_id, status = ?record.status, "channel created");
        self.channels.insert(channel_id, record);
        Ok(events)
    }

    pub fn join(
        &mut self,
        channel_id: ChannelId,
        index: usize,
        signature: Bytes,
    ) -> Result<Vec<CustodyEvent>> {
        let record = self.record(channel_id)?;
        require_status(record, &[ChannelStatus::Initial])?;
        if index == CREATOR || index >= record.channel.participants.len() {
            return Err(CustodyError::InvalidParticipantIndex(index));
        }
        let participant = record.channel.participants[index];
        if !sigverify::verify(
            &SignedPayload::state(&record.last_valid_state, channel_id),
            &signature,
            participant,
            self.domain_separator,
            &self.contracts,
        ) {
            return Err(CustodyError::InvalidSignature(index));
        }
        let deposit = &record.expected_deposits[index];
        self.ensure_available(participant, deposit.token, deposit.amount)?;

        let mut record = record.clone();
        self.lock_deposit(&mut record, index);
        record.last_valid_state.sigs.insert(index, signature);
        let mut events = vec![CustodyEvent::Joined { channel_id, index }];
        if record.is_funded() {
            record.status = ChannelStatus::Active;
            events.push(CustodyEvent::Opened { channel_id });
        }
        info!(%channel_id, index, status = ?record.status, "channel joined");
        self.channels.insert(channel_id, record);
        Ok(events)
    }

    /// Starts a dispute with `candidate`. The challenger must be a participant, signing the candidate's challenge
    /// message. The candidate is either the stored state or a newer one. A channel still waiting for deposits can only
    /// be challenged with its initial state.
    pub fn challenge(
        &mut self,
        channel_id: ChannelId,
        candidate: State,
        proofs: &[State],
        challenger_signature: Bytes,
        now: u64,
    ) -> Result<Vec<CustodyEvent>> {
        let record = self.record(channel_id)?;
        require_status(record, &[ChannelStatus::Initial, ChannelStatus::Active])?;

        let message = SignedPayload::message(candidate.challenge_message(channel_id));
        let challenger_is_participant = record.channel.participants.iter().any(|participant| {
            sigverify::verify(
                &message,
                &challenger_signature,
                *participant,
                self.domain_separator,
                &self.contracts,
            )
        });
        if !challenger_is_participant {
            return Err(CustodyError::InvalidChallengerSignature);
        }

        // The stored state may always be disputed again.
        let state = if candidate.hash(channel_id) == record.last_valid_state.hash(channel_id) {
            record.last_valid_state.clone()
        } else if record.status == ChannelStatus::Initial {
            return Err(CustodyError::InvalidState);
        } else {
            self.validate_candidate(channel_id, record, &candidate, proofs)?;
            candidate
        };

        let expiration = now
            .checked_add(record.channel.challenge)
            .ok_or(CustodyError::InvalidChallengePeriod(record.channel.challenge))?;
        let mut record = record.clone();
        record.status = ChannelStatus::Dispute;
        record.challenge_expiry = expiration;
        record.last_valid_state = state.clone();
        info!(%channel_id, version = state.version, expiration, "channel challenged");
        self.channels.insert(channel_id, record);
        Ok(vec![CustodyEvent::Challenged {
            channel_id,
            state,
            expiration,
        }])
    }

    /// Records a newer state on chain. A disputed channel returns to ACTIVE.
    pub fn checkpoint(
        &mut self,
        channel_id: ChannelId,
        candidate: State,
        proofs: &[State],
    ) -> Result<Vec<CustodyEvent>> {
        let record = self.record(channel_id)?;
        require_status(record, &[ChannelStatus::Active, ChannelStatus::Dispute])?;
        self.validate_candidate(channel_id, record, &candidate, proofs)?;

        let mut record = record.clone();
        record.status = ChannelStatus::Active;
        record.challenge_expiry = 0;
        record.last_valid_state = candidate.clone();
        info!(%channel_id, version = candidate.version, "channel checkpointed");
        self.channels.insert(channel_id, record);
        Ok(vec![CustodyEvent::Checkpointed {
            channel_id,
            state: candidate,
        }])
    }

    /// Moves funds between the creator's available balance and the channel with a mutually signed RESIZE state.
    ///
    /// The state preceding the candidate is the first proof when one is given, otherwise the stored state.
    pub fn resize(
        &mut self,
        channel_id: ChannelId,
        candidate: State,
        proofs: &[State],
    ) -> Result<Vec<CustodyEvent>> {
        let record = self.record(channel_id)?;
        require_status(record, &[ChannelStatus::Active])?;
        if candidate.intent != StateIntent::Resize {
            return Err(CustodyError::InvalidIntent {
                expected: StateIntent::Resize,
                actual: candidate.intent,
            });
        }

        let stored = &record.last_valid_state;
        let preceding = match proofs {
            [] => stored,
            [proof] => {
                let anchored = proof.hash(channel_id) == stored.hash(channel_id)
                    || (proof.version >= stored.version
                        && self.missing_signature(&record.channel, channel_id, proof).is_none()
                        && nonzero(&proof.totals().map_err(|_| CustodyError::InvalidAllocations)?)
                            == nonzero(&record.locked));
                if !anchored {
                    return Err(CustodyError::InvalidState);
                }
                proof
            }
            _ => return Err(CustodyError::InvalidState),
        };
        if candidate.version != preceding.version + 1 {
            return Err(CustodyError::InvalidVersion {
                expected: (preceding.version + 1).to_string(),
                actual: candidate.version,
            });
        }
        if let Some(index) = self.missing_signature(&record.channel, channel_id, &candidate) {
            return Err(CustodyError::InvalidSignature(index));
        }
        let amounts =
            ResizeAmounts::decode(&candidate.data).map_err(|_| CustodyError::InvalidResizeAmounts)?;
        if !amounts.has_opposite_signs() {
            return Err(CustodyError::InvalidResizeAmounts);
        }
        if candidate.allocations.len() != PARTICIPANTS
            || preceding.allocations.len() != PARTICIPANTS
            || candidate
                .allocations
                .iter()
                .zip(&preceding.allocations)
                .any(|(a, b)| a.destination != b.destination || a.token != b.token)
        {
            return Err(CustodyError::InvalidAllocations);
        }
        let creator = &candidate.allocations[CREATOR];
        let expected_creator = apply_delta(preceding.allocations[CREATOR].amount, amounts.resize_amount)
            .ok_or(CustodyError::InvalidResizeAmounts)?;
        if creator.amount != expected_creator
            || candidate.allocations[BROKER].amount != preceding.allocations[BROKER].amount
        {
            return Err(CustodyError::InvalidAllocations);
        }

        let token = creator.token;
        let delta = amounts.resize_amount.unsigned_abs();
        let locked = record.locked.get(&token).copied().unwrap_or_default();
        let payer = record.channel.participants[CREATOR];
        let locked = if amounts.resize_amount.is_positive() {
            self.ensure_available(payer, token, delta)?;
            locked + delta
        } else {
            locked
                .checked_sub(delta)
                .ok_or(CustodyError::InvalidResizeAmounts)?
        };

        let mut record = record.clone();
        let destination = creator.destination;
        if amounts.resize_amount.is_positive() {
            self.debit(payer, token, delta);
        } else {
            self.credit(destination, token, delta);
        }
        record.locked.insert(token, locked);
        record.last_valid_state = candidate.clone();
        info!(%channel_id, version = candidate.version, resize = %amounts.resize_amount, allocate = %amounts.allocate_amount, "channel resized");
        self.channels.insert(channel_id, record);
        Ok(vec![CustodyEvent::Resized {
            channel_id,
            amounts,
            state: candidate,
        }])
    }

    /// Settles and deletes a channel.
    ///
    /// A FINALIZE state signed by every participant closes the channel at any time. Once a dispute has expired
    /// according to `now`, the channel closes with its last valid state and `candidate` is ignored.
    pub fn close(
        &mut self,
        channel_id: ChannelId,
        candidate: State,
        now: u64,
    ) -> Result<Vec<CustodyEvent>> {
        let record = self.record(channel_id)?;
        let expired = record.status == ChannelStatus::Dispute && now >= record.challenge_expiry;
        let state = if expired {
            record.last_valid_state.clone()
        } else {
            if candidate.intent != StateIntent::Finalize {
                if record.status == ChannelStatus::Dispute {
                    return Err(CustodyError::ChallengeNotExpired);
                }
                return Err(CustodyError::InvalidIntent {
                    expected: StateIntent::Finalize,
                    actual: candidate.intent,
                });
            }
            let adjudicator = self.adjudicator(&record.channel)?;
            if !adjudicator::is_newer(&*adjudicator, &candidate, &record.last_valid_state) {
                return Err(CustodyError::StaleState);
            }
            if let Some(index) = self.missing_signature(&record.channel, channel_id, &candidate) {
                return Err(CustodyError::InvalidSignature(index));
            }
            require_conserved(record, &candidate)?;
            candidate
        };

        let record = record.clone();
        if record.is_funded() {
            for allocation in &state.allocations {
                self.credit(allocation.destination, allocation.token, allocation.amount);
            }
        } else {
            // Never opened: participants get back exactly what they put in.
            for (participant, deposit) in record.channel.participants.iter().zip(&record.actual_deposits) {
                self.credit(*participant, deposit.token, deposit.amount);
            }
        }
        self.channels.remove(&channel_id);
        info!(%channel_id, version = state.version, expired, "channel closed");
        Ok(vec![CustodyEvent::Closed { channel_id, state }])
    }

    pub fn deposit(
        &mut self,
        wallet: Address,
        token: Address,
        amount: U256,
    ) -> Result<Vec<CustodyEvent>> {
        if amount.is_zero() {
            return Err(CustodyError::InvalidAmount);
        }
        self.credit(wallet, token, amount);
        debug!(%wallet, %token, %amount, "deposited");
        Ok(vec![CustodyEvent::Deposited {
            wallet,
            token,
            amount,
        }])
    }

    pub fn withdraw(
        &mut self,
        wallet: Address,
        token: Address,
        amount: U256,
    ) -> Result<Vec<CustodyEvent>> {
        if amount.is_zero() {
            return Err(CustodyError::InvalidAmount);
        }
        self.ensure_available(wallet, token, amount)?;
        self.debit(wallet, token, amount);
        debug!(%wallet, %token, %amount, "withdrawn");
        Ok(vec![CustodyEvent::Withdrawn {
            wallet,
            token,
            amount,
        }])
    }

    fn record(&self, channel_id: ChannelId) -> Result<&ChannelRecord> {
        self.channels
            .get(&channel_id)
            .ok_or(CustodyError::ChannelNotFound(channel_id))
    }

    fn adjudicator(&self, channel: &Channel) -> Result<Arc<dyn Adjudicator>> {
        self.adjudicators
            .get(channel.adjudicator)
            .ok_or(CustodyError::UnknownAdjudicator(channel.adjudicator))
    }

    fn is_signed_by(
        &self,
        channel: &Channel,
        channel_id: ChannelId,
        state: &State,
        index: usize,
    ) -> bool {
        let (Some(signer), Some(signature)) = (channel.participants.get(index), state.signature(index))
        else {
            return false;
        };
        sigverify::verify(
            &SignedPayload::state(state, channel_id),
            signature,
            *signer,
            self.domain_separator,
            &self.contracts,
        )
    }

    fn missing_signature(
        &self,
        channel: &Channel,
        channel_id: ChannelId,
        state: &State,
    ) -> Option<usize> {
        (0..channel.participants.len())
            .find(|index| !self.is_signed_by(channel, channel_id, state, *index))
    }

    /// Checks that `candidate` may replace the stored state of an opened channel.
    fn validate_candidate(
        &self,
        channel_id: ChannelId,
        record: &ChannelRecord,
        candidate: &State,
        proofs: &[State],
    ) -> Result<()> {
        let adjudicator = self.adjudicator(&record.channel)?;
        if !adjudicator::is_newer(&*adjudicator, candidate, &record.last_valid_state) {
            return Err(CustodyError::StaleState);
        }
        match candidate.intent {
            StateIntent::Operate => {
                let context = Context {
                    channel: &record.channel,
                    channel_id,
                    stored: &record.last_valid_state,
                    domain_separator: self.domain_separator,
                    env: &self.contracts,
                };
                if !adjudicator.adjudicate(&context, candidate, proofs) {
                    return Err(CustodyError::InvalidState);
                }
            }
            StateIntent::Initialize => {
                return Err(CustodyError::InvalidIntent {
                    expected: StateIntent::Operate,
                    actual: candidate.intent,
                });
            }
            StateIntent::Resize | StateIntent::Finalize => {
                if let Some(index) = self.missing_signature(&record.channel, channel_id, candidate) {
                    return Err(CustodyError::InvalidSignature(index));
                }
            }
        }
        require_conserved(record, candidate)
    }

    fn ensure_available(&self, account: Address, token: Address, required: U256) -> Result<()> {
        let available = self.available(account, token);
        if available < required {
            return Err(CustodyError::InsufficientBalance {
                account,
                token,
                available,
                required,
            });
        }
        Ok(())
    }

    fn lock_deposit(&mut self, record: &mut ChannelRecord, index: usize) {
        let deposit = record.expected_deposits[index].clone();
        self.debit(record.channel.participants[index], deposit.token, deposit.amount);
        *record.locked.entry(deposit.token).or_default() += deposit.amount;
        record.actual_deposits[index] = deposit;
        record.joined[index] = true;
    }

    fn credit(&mut self, account: Address, token: Address, amount: U256) {
        *self.available.entry((account, token)).or_default() += amount;
    }

    /// Callers check the balance with [Self::ensure_available] first.
    fn debit(&mut self, account: Address, token: Address, amount: U256) {
        let balance = self.available.entry((account, token)).or_default();
        *balance = balance.saturating_sub(amount);
    }
}

fn require_status(record: &ChannelRecord, expected: &'static [ChannelStatus]) -> Result<()> {
    if !expected.contains(&record.status) {
        return Err(CustodyError::InvalidStatus {
            expected,
            actual: record.status,
        });
    }
    Ok(())
}

/// The candidate must allocate exactly the funds the channel holds.
fn require_conserved(record: &ChannelRecord, candidate: &State) -> Result<()> {
    let totals = candidate
        .totals()
        .map_err(|_| CustodyError::InvalidAllocations)?;
    if nonzero(&totals) != nonzero(&record.locked) {
        return Err(CustodyError::InvalidAllocations);
    }
    Ok(())
}

fn nonzero(totals: &BTreeMap<Address, U256>) -> BTreeMap<Address, U256> {
    totals
        .iter()
        .filter(|(_, amount)| !amount.is_zero())
        .map(|(token, amount)| (*token, *amount))
        .collect()
}

fn apply_delta(amount: U256, delta: I256) -> Option<U256> {
    if delta.is_negative() {
        amount.checked_sub(delta.unsigned_abs())
    } else {
        amount.checked_add(delta.unsigned_abs())
    }
}
