//! An in-process chain hosting a single custody and the token balances it pulls from.
//!
//! Each successful call is a transaction mined into its own block. The block timestamp is the only clock the custody
//! ever sees.

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    custody::{ChannelRecord, Custody, CustodyConfig, CustodyEvent},
    error::CustodyError,
    state::{Channel, ChannelId, State},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CustodyCall {
    Create {
        channel: Channel,
        initial: State,
    },
    Join {
        channel_id: ChannelId,
        index: usize,
        signature: Bytes,
    },
    Challenge {
        channel_id: ChannelId,
        candidate: State,
        proofs: Vec<State>,
        challenger_signature: Bytes,
    },
    Checkpoint {
        channel_id: ChannelId,
        candidate: State,
        proofs: Vec<State>,
    },
    Resize {
        channel_id: ChannelId,
        candidate: State,
        proofs: Vec<State>,
    },
    Close {
        channel_id: ChannelId,
        candidate: State,
    },
    Deposit {
        token: Address,
        amount: U256,
    },
    Withdraw {
        token: Address,
        amount: U256,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub event: CustodyEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub logs: Vec<Log>,
}

/// Everything a transaction may touch.
#[derive(Debug, Clone)]
struct World {
    custody: Custody,
    /// Token balances held outside the custody, keyed by `(holder, token)`.
    tokens: BTreeMap<(Address, Address), U256>,
}

#[derive(Debug)]
pub struct LocalChain {
    world: World,
    head: BlockHeader,
    /// Timestamp the next block will carry.
    pending_timestamp: u64,
    logs: Vec<Log>,
    transaction_count: u64,
}

impl LocalChain {
    pub fn new(config: CustodyConfig, genesis_timestamp: u64) -> Self {
        LocalChain {
            world: World {
                custody: Custody::new(config),
                tokens: BTreeMap::new(),
            },
            head: BlockHeader {
                number: 0,
                timestamp: genesis_timestamp,
            },
            pending_timestamp: genesis_timestamp,
            logs: Vec::new(),
            transaction_count: 0,
        }
    }

    pub fn custody(&self) -> &Custody {
        &self.world.custody
    }

    /// Setup access to the custody, for registering adjudicators and deploying wallet contracts.
    pub fn custody_mut(&mut self) -> &mut Custody {
        &mut self.world.custody
    }

    pub fn chain_id(&self) -> u64 {
        self.world.custody.config().chain_id
    }

    pub fn head(&self) -> BlockHeader {
        self.head
    }

    /// The chain's notion of now: the timestamp the next block will carry.
    pub fn now(&self) -> u64 {
        self.pending_timestamp
    }

    pub fn advance_time(&mut self, seconds: u64) {
        self.pending_timestamp += seconds;
    }

    pub fn mint(&mut self, holder: Address, token: Address, amount: U256) {
        *self.world.tokens.entry((holder, token)).or_default() += amount;
    }

    pub fn token_balance(&self, holder: Address, token: Address) -> U256 {
        self.world
            .tokens
            .get(&(holder, token))
            .copied()
            .unwrap_or_default()
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<ChannelRecord> {
        self.world.custody.channel(channel_id).cloned()
    }

    pub fn available(&self, account: Address, token: Address) -> U256 {
        self.world.custody.available(account, token)
    }

    /// Logs emitted in blocks `from..=to`.
    pub fn logs(&self, from: u64, to: u64) -> Vec<Log> {
        self.logs
            .iter()
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .cloned()
            .collect()
    }

    /// Executes `call` as a transaction sent by `from`. A reverted call changes nothing and mines no block.
    pub fn execute(&mut self, from: Address, call: CustodyCall) -> Result<Receipt, CustodyError> {
        let now = self.pending_timestamp;
        let mut world = self.world.clone();
        let events = match apply(&mut world, from, call, now) {
            Ok(events) => events,
            Err(error) => {
                debug!(%from, %error, "transaction reverted");
                return Err(error);
            }
        };

        self.world = world;
        self.head = BlockHeader {
            number: self.head.number + 1,
            timestamp: now,
        };
        self.transaction_count += 1;
        let tx_hash = keccak256(
            [
                from.as_slice(),
                &self.transaction_count.to_be_bytes(),
                &self.head.number.to_be_bytes(),
            ]
            .concat(),
        );
        let logs: Vec<_> = events
            .into_iter()
            .enumerate()
            .map(|(index, event)| Log {
                block_number: self.head.number,
                tx_hash,
                log_index: index as u64,
                event,
            })
            .collect();
        self.logs.extend(logs.iter().cloned());
        trace!(block = self.head.number, %tx_hash, logs = logs.len(), "block mined");
        Ok(Receipt {
            tx_hash,
            block_number: self.head.number,
            logs,
        })
    }
}

fn apply(
    world: &mut World,
    from: Address,
    call: CustodyCall,
    now: u64,
) -> Result<Vec<CustodyEvent>, CustodyError> {
    let custody = &mut world.custody;
    match call {
        CustodyCall::Create { channel, initial } => custody.create(channel, initial),
        CustodyCall::Join {
            channel_id,
            index,
            signature,
        } => custody.join(channel_id, index, signature),
        CustodyCall::Challenge {
            channel_id,
            candidate,
            proofs,
            challenger_signature,
        } => custody.challenge(channel_id, candidate, &proofs, challenger_signature, now),
        CustodyCall::Checkpoint {
            channel_id,
            candidate,
            proofs,
        } => custody.checkpoint(channel_id, candidate, &proofs),
        CustodyCall::Resize {
            channel_id,
            candidate,
            proofs,
        } => custody.resize(channel_id, candidate, &proofs),
        CustodyCall::Close {
            channel_id,
            candidate,
        } => custody.close(channel_id, candidate, now),
        CustodyCall::Deposit { token, amount } => {
            let balance = world.tokens.entry((from, token)).or_default();
            if *balance < amount {
                return Err(CustodyError::InsufficientBalance {
                    account: from,
                    token,
                    available: *balance,
                    required: amount,
                });
            }
            *balance -= amount;
            custody.deposit(from, token, amount)
        }
        CustodyCall::Withdraw { token, amount } => {
            let events = custody.withdraw(from, token, amount)?;
            *world.tokens.entry((from, token)).or_default() += amount;
            Ok(events)
        }
    }
}
