//! Pluggable validators for OPERATE-intent transitions.

use std::{cmp::Ordering, collections::BTreeMap, fmt::Debug, sync::Arc};

use alloy::primitives::{Address, B256};

use crate::{
    evm::ContractEnv,
    sigverify::{self, SignedPayload},
    state::{Channel, ChannelId, State},
};

mod consensus;
mod remittance;

pub use consensus::Consensus;
pub use remittance::Remittance;

/// Everything an adjudicator may consult besides the states themselves.
pub struct Context<'a> {
    pub channel: &'a Channel,
    pub channel_id: ChannelId,
    /// The last state the custody accepted for this channel.
    pub stored: &'a State,
    pub domain_separator: B256,
    pub env: &'a dyn ContractEnv,
}

impl Context<'_> {
    pub fn is_signed_by(&self, state: &State, index: usize) -> bool {
        let (Some(signer), Some(signature)) =
            (self.channel.participants.get(index), state.signature(index))
        else {
            return false;
        };
        sigverify::verify(
            &SignedPayload::state(state, self.channel_id),
            signature,
            *signer,
            self.domain_separator,
            self.env,
        )
    }

    pub fn is_signed_by_all(&self, state: &State) -> bool {
        (0..self.channel.participants.len()).all(|index| self.is_signed_by(state, index))
    }

    /// A state proofs can be anchored on: either the stored state or one every participant signed.
    pub fn is_anchor(&self, state: &State) -> bool {
        state.hash(self.channel_id) == self.stored.hash(self.channel_id)
            || self.is_signed_by_all(state)
    }
}

pub trait Adjudicator: Debug + Send + Sync {
    /// Whether `candidate` is a legitimate successor of the states in `proofs`. When no proofs are supplied the
    /// stored state is the predecessor.
    fn adjudicate(&self, context: &Context<'_>, candidate: &State, proofs: &[State]) -> bool;

    /// Orders two states of the same channel. `None` means the adjudicator has no opinion and versions decide.
    fn compare(&self, _candidate: &State, _previous: &State) -> Option<Ordering> {
        None
    }
}

/// Whether `candidate` supersedes `previous`. Equal states never do.
pub fn is_newer(adjudicator: &dyn Adjudicator, candidate: &State, previous: &State) -> bool {
    match adjudicator.compare(candidate, previous) {
        Some(ordering) => ordering == Ordering::Greater,
        None => candidate.version > previous.version,
    }
}

/// Adjudicators known to the custody, keyed by the address channels refer to them with.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    adjudicators: BTreeMap<Address, Arc<dyn Adjudicator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: Address, adjudicator: Arc<dyn Adjudicator>) {
        self.adjudicators.insert(address, adjudicator);
    }

    pub fn get(&self, address: Address) -> Option<Arc<dyn Adjudicator>> {
        self.adjudicators.get(&address).cloned()
    }
}
