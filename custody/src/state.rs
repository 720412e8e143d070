//! Channels, states and their canonical ABI encodings.

use std::collections::BTreeMap;

use alloy::{
    primitives::{Address, B256, Bytes, I256, U256, keccak256},
    sol,
    sol_types::{SolStruct, SolType, SolValue, sol_data},
};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::crypto::{SecretKey, eip712_digest};

pub type ChannelId = B256;

/// Number of participants in every channel: the creator at index 0 and the broker at index 1.
pub const PARTICIPANTS: usize = 2;
pub const CREATOR: usize = 0;
pub const BROKER: usize = 1;

mod abi {
    use super::sol;

    sol! {
        struct Allocation {
            address destination;
            address token;
            uint256 amount;
        }

        struct AllowStateHash {
            bytes32 channelId;
            uint8 intent;
            uint256 version;
            bytes data;
            Allocation[] allocations;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StateIntent {
    Operate = 0,
    Initialize = 1,
    Resize = 2,
    Finalize = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Void,
    Initial,
    Active,
    Dispute,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Address,
    pub token: Address,
    pub amount: U256,
}

impl Allocation {
    pub fn new(destination: Address, token: Address, amount: U256) -> Self {
        Allocation {
            destination,
            token,
            amount,
        }
    }

    fn to_abi(&self) -> abi::Allocation {
        abi::Allocation {
            destination: self.destination,
            token: self.token,
            amount: self.amount,
        }
    }
}

/// The immutable definition of a channel. Its hash is the channel's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub participants: Vec<Address>,
    pub adjudicator: Address,
    /// Challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
}

impl Channel {
    pub fn id(&self, chain_id: u64) -> ChannelId {
        keccak256(
            (
                self.participants.clone(),
                self.adjudicator,
                self.challenge,
                self.nonce,
                U256::from(chain_id),
            )
                .abi_encode_params(),
        )
    }

    pub fn participant_index(&self, address: Address) -> Option<usize> {
        self.participants.iter().position(|p| *p == address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub intent: StateIntent,
    pub version: u64,
    pub data: Bytes,
    pub allocations: Vec<Allocation>,
    /// Signatures keyed by participant index.
    #[serde(default)]
    pub sigs: BTreeMap<usize, Bytes>,
}

impl State {
    pub fn new(
        intent: StateIntent,
        version: u64,
        data: Bytes,
        allocations: Vec<Allocation>,
    ) -> Self {
        State {
            intent,
            version,
            data,
            allocations,
            sigs: BTreeMap::new(),
        }
    }

    /// `abi.encode(channelId, intent, version, data, allocations)`.
    pub fn packed(&self, channel_id: ChannelId) -> Bytes {
        let allocations: Vec<abi::Allocation> =
            self.allocations.iter().map(Allocation::to_abi).collect();
        <(
            sol_data::FixedBytes<32>,
            sol_data::Uint<8>,
            sol_data::Uint<256>,
            sol_data::Bytes,
            sol_data::Array<abi::Allocation>,
        ) as SolType>::abi_encode_params(&(
            channel_id,
            self.intent as u8,
            U256::from(self.version),
            self.data.clone(),
            allocations,
        ))
        .into()
    }

    pub fn hash(&self, channel_id: ChannelId) -> B256 {
        keccak256(self.packed(channel_id))
    }

    /// The EIP-712 struct hash of this state.
    pub fn struct_hash(&self, channel_id: ChannelId) -> B256 {
        abi::AllowStateHash {
            channelId: channel_id,
            intent: self.intent as u8,
            version: U256::from(self.version),
            data: self.data.clone(),
            allocations: self.allocations.iter().map(Allocation::to_abi).collect(),
        }
        .eip712_hash_struct()
    }

    pub fn eip712_digest(&self, channel_id: ChannelId, domain_separator: B256) -> B256 {
        eip712_digest(domain_separator, self.struct_hash(channel_id))
    }

    /// `packed ‖ "challenge"`, the message a challenger signs to open a dispute with this state.
    pub fn challenge_message(&self, channel_id: ChannelId) -> Bytes {
        let mut preimage = self.packed(channel_id).to_vec();
        preimage.extend_from_slice(b"challenge");
        preimage.into()
    }

    pub fn challenge_hash(&self, channel_id: ChannelId) -> B256 {
        keccak256(self.challenge_message(channel_id))
    }

    /// Signs the raw state hash and records the signature under `index`.
    pub fn sign(&mut self, key: &SecretKey, channel_id: ChannelId, index: usize) {
        let signature = key.sign_hash(self.hash(channel_id));
        self.sigs.insert(index, signature);
    }

    pub fn signature(&self, index: usize) -> Option<&Bytes> {
        self.sigs.get(&index).filter(|s| !s.is_empty())
    }

    /// Sums the allocations of each token.
    pub fn totals(&self) -> Result<BTreeMap<Address, U256>> {
        let mut totals = BTreeMap::new();
        for allocation in &self.allocations {
            let total: &mut U256 = totals.entry(allocation.token).or_default();
            *total = total
                .checked_add(allocation.amount)
                .ok_or_else(|| anyhow!("allocation overflow"))?;
        }
        Ok(totals)
    }
}

/// The deltas carried by a RESIZE state: `resize_amount` moves funds between the creator's custody balance and the
/// channel, `allocate_amount` moves funds between the channel and the creator's unified off-chain balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeAmounts {
    pub resize_amount: I256,
    pub allocate_amount: I256,
}

impl ResizeAmounts {
    pub fn new(resize_amount: I256, allocate_amount: I256) -> Self {
        ResizeAmounts {
            resize_amount,
            allocate_amount,
        }
    }

    pub fn encode(&self) -> Bytes {
        vec![self.resize_amount, self.allocate_amount]
            .abi_encode()
            .into()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let amounts = <Vec<I256>>::abi_decode(data, true)?;
        let [resize_amount, allocate_amount] = amounts[..] else {
            return Err(anyhow!(
                "expected two resize amounts, got {}",
                amounts.len()
            ));
        };
        Ok(ResizeAmounts {
            resize_amount,
            allocate_amount,
        })
    }

    /// The two amounts must pull in strictly opposite directions.
    pub fn has_opposite_signs(&self) -> bool {
        (self.resize_amount.is_positive() && self.allocate_amount.is_negative())
            || (self.resize_amount.is_negative() && self.allocate_amount.is_positive())
    }
}
