//! The broker's view of the settlement layer.

use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use custody::{
    ChannelRecord,
    chain::{BlockHeader, CustodyCall, LocalChain, Log, Receipt},
    error::CustodyError,
    state::ChannelId,
};
use parking_lot::Mutex;
use tracing::*;

use crate::error::RpcError;

#[derive(thiserror::Error, Debug)]
pub enum SettlementError {
    /// The transaction was executed and reverted. Nothing changed on chain.
    #[error("transaction reverted: {0}")]
    Reverted(#[from] CustodyError),
    /// The settlement layer could not be reached. The outcome of a submitted transaction is unknown.
    #[error("settlement transport failed: {0}")]
    Transport(#[from] anyhow::Error),
}

impl From<SettlementError> for RpcError {
    fn from(error: SettlementError) -> Self {
        match error {
            SettlementError::Reverted(revert) => RpcError::ContractRevert(revert),
            SettlementError::Transport(e) => RpcError::Internal(e),
        }
    }
}

/// Read access to the settlement layer, and the ability to submit transactions as the broker.
#[async_trait]
pub trait Settlement: Send + Sync + 'static {
    /// The address transactions are sent from.
    fn sender(&self) -> Address;

    async fn head(&self) -> Result<BlockHeader, SettlementError>;

    /// Logs emitted in blocks `from..=to`, in chain order.
    async fn logs(&self, from: u64, to: u64) -> Result<Vec<Log>, SettlementError>;

    async fn channel(&self, channel_id: ChannelId) -> Result<Option<ChannelRecord>, SettlementError>;

    async fn submit(&self, call: CustodyCall) -> Result<Receipt, SettlementError>;
}

/// A [Settlement] backed by an in-process [LocalChain].
#[derive(Debug, Clone)]
pub struct LocalSettlement {
    chain: Arc<Mutex<LocalChain>>,
    sender: Address,
}

impl LocalSettlement {
    pub fn new(chain: Arc<Mutex<LocalChain>>, sender: Address) -> Self {
        LocalSettlement { chain, sender }
    }

    pub fn chain(&self) -> &Arc<Mutex<LocalChain>> {
        &self.chain
    }
}

#[async_trait]
impl Settlement for LocalSettlement {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn head(&self) -> Result<BlockHeader, SettlementError> {
        Ok(self.chain.lock().head())
    }

    async fn logs(&self, from: u64, to: u64) -> Result<Vec<Log>, SettlementError> {
        Ok(self.chain.lock().logs(from, to))
    }

    async fn channel(&self, channel_id: ChannelId) -> Result<Option<ChannelRecord>, SettlementError> {
        Ok(self.chain.lock().channel(channel_id))
    }

    async fn submit(&self, call: CustodyCall) -> Result<Receipt, SettlementError> {
        let receipt = self.chain.lock().execute(self.sender, call)?;
        debug!(tx_hash = %receipt.tx_hash, block = receipt.block_number, "transaction submitted");
        Ok(receipt)
    }
}
