mod dispute;
mod lifecycle;

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, I256, U256};
use custody::{
    CustodyConfig,
    adjudicator::{Consensus, Remittance},
    chain::{CustodyCall, LocalChain, Receipt},
    crypto::SecretKey,
    error::CustodyError,
    state::{Allocation, BROKER, Channel, ChannelId, ResizeAmounts, State, StateIntent},
};

pub const CONSENSUS: Address = Address::repeat_byte(0xa1);
pub const REMITTANCE: Address = Address::repeat_byte(0xa2);
pub const TOKEN: Address = Address::repeat_byte(0x70);

/// A chain with one funded creator and one funded broker.
pub struct Harness {
    pub chain: LocalChain,
    pub creator: SecretKey,
    pub broker: SecretKey,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let mut chain = LocalChain::new(
            CustodyConfig {
                chain_id: 31337,
                address: Address::repeat_byte(0xcc),
                min_challenge_period: 60,
                eip712: true,
            },
            1_700_000_000,
        );
        chain
            .custody_mut()
            .register_adjudicator(CONSENSUS, Arc::new(Consensus));
        chain
            .custody_mut()
            .register_adjudicator(REMITTANCE, Arc::new(Remittance));

        let mut harness = Harness {
            chain,
            creator: SecretKey::new(),
            broker: SecretKey::new(),
        };
        for key in [harness.creator.clone(), harness.broker.clone()] {
            harness.chain.mint(key.address(), TOKEN, U256::from(1_000));
            harness
                .call(
                    &key,
                    CustodyCall::Deposit {
                        token: TOKEN,
                        amount: U256::from(500),
                    },
                )
                .unwrap();
        }
        harness
    }

    pub fn call(&mut self, from: &SecretKey, call: CustodyCall) -> Result<Receipt, CustodyError> {
        self.chain.execute(from.address(), call)
    }

    pub fn channel(&self, adjudicator: Address) -> Channel {
        Channel {
            participants: vec![self.creator.address(), self.broker.address()],
            adjudicator,
            challenge: 3_600,
            nonce: 42,
        }
    }

    pub fn state(&self, intent: StateIntent, version: u64, amounts: [u64; 2]) -> State {
        State::new(
            intent,
            version,
            Bytes::new(),
            vec![
                Allocation::new(self.creator.address(), TOKEN, U256::from(amounts[0])),
                Allocation::new(self.broker.address(), TOKEN, U256::from(amounts[1])),
            ],
        )
    }

    pub fn resize_state(&self, version: u64, amounts: [u64; 2], resize: i64, allocate: i64) -> State {
        let mut state = self.state(StateIntent::Resize, version, amounts);
        state.data = ResizeAmounts::new(I256::try_from(resize).unwrap(), I256::try_from(allocate).unwrap())
            .encode();
        state
    }

    pub fn sign(&self, channel_id: ChannelId, mut state: State, by: &[usize]) -> State {
        for index in by {
            let key = [&self.creator, &self.broker][*index];
            state.sign(key, channel_id, *index);
        }
        state
    }

    /// Creates and joins a channel, returning its id.
    pub fn open(&mut self, adjudicator: Address, amounts: [u64; 2]) -> ChannelId {
        let channel = self.channel(adjudicator);
        let channel_id = channel.id(self.chain.chain_id());
        let initial = self.sign(channel_id, self.state(StateIntent::Initialize, 0, amounts), &[0]);
        let creator = self.creator.clone();
        self.call(
            &creator,
            CustodyCall::Create {
                channel,
                initial: initial.clone(),
            },
        )
        .unwrap();
        let broker = self.broker.clone();
        let signature = broker.sign_hash(initial.hash(channel_id));
        self.call(
            &broker,
            CustodyCall::Join {
                channel_id,
                index: BROKER,
                signature,
            },
        )
        .unwrap();
        channel_id
    }

    pub fn available(&self, key: &SecretKey) -> U256 {
        self.chain.available(key.address(), TOKEN)
    }
}
