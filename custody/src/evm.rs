//! A minimal EVM world used to evaluate contract-wallet signatures.
//!
//! Only code matters here: accounts carry bytecode, calls are executed with zero gas price from the zero address,
//! and nothing is ever charged. Calls made through [ContractEnv] never persist state, with the exception of
//! [ScratchEvm::transact], which is how contracts get deployed in the first place.

use alloy::primitives::{Address, B256, Bytes, U256};
use revm::{
    DatabaseRef, Evm,
    db::{CacheDB, EmptyDB},
    primitives::{AccountInfo, Bytecode, ExecutionResult, KECCAK_EMPTY, TxKind},
};
use tracing::*;

/// Gas made available to every call.
const CALL_GAS_LIMIT: u64 = 30_000_000;

/// The on-chain environment signature verification can consult.
pub trait ContractEnv {
    /// Whether `address` has code deployed.
    fn has_code(&self, address: Address) -> bool;

    /// Executes a read-only call and returns its output, or `None` if it reverted or halted.
    fn static_call(&self, to: Address, data: Bytes) -> Option<Bytes>;

    /// Executes `factory_calldata` against `factory` in a throwaway copy of the world, then performs a read-only call
    /// to `to` in that same copy. The copy is discarded afterwards.
    fn simulate_then_call(
        &self,
        factory: Address,
        factory_calldata: Bytes,
        to: Address,
        data: Bytes,
    ) -> Option<Bytes>;
}

/// An environment with no contracts at all. Every address is treated as an externally owned account.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContracts;

impl ContractEnv for NoContracts {
    fn has_code(&self, _: Address) -> bool {
        false
    }

    fn static_call(&self, _: Address, _: Bytes) -> Option<Bytes> {
        None
    }

    fn simulate_then_call(&self, _: Address, _: Bytes, _: Address, _: Bytes) -> Option<Bytes> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ScratchEvm {
    db: CacheDB<EmptyDB>,
}

impl Default for ScratchEvm {
    fn default() -> Self {
        ScratchEvm {
            db: CacheDB::new(EmptyDB::default()),
        }
    }
}

impl ScratchEvm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places runtime `code` at `address`, replacing whatever was there.
    pub fn deploy_code(&mut self, address: Address, code: Bytes) {
        let bytecode = Bytecode::new_raw(code);
        let info = AccountInfo {
            balance: U256::ZERO,
            nonce: 1,
            code_hash: bytecode.hash_slow(),
            code: Some(bytecode),
        };
        self.db.insert_account_info(address, info);
    }

    /// Executes a call and commits its effects.
    pub fn transact(&mut self, caller: Address, to: Address, data: Bytes) -> Option<Bytes> {
        execute(&mut self.db, caller, to, data, true)
    }

    pub fn code_hash(&self, address: Address) -> Option<B256> {
        let info = self.db.basic_ref(address).ok().flatten()?;
        (info.code_hash != KECCAK_EMPTY && info.code_hash != B256::ZERO).then_some(info.code_hash)
    }
}

impl ContractEnv for ScratchEvm {
    fn has_code(&self, address: Address) -> bool {
        self.code_hash(address).is_some()
    }

    fn static_call(&self, to: Address, data: Bytes) -> Option<Bytes> {
        let mut db = self.db.clone();
        execute(&mut db, Address::ZERO, to, data, false)
    }

    fn simulate_then_call(
        &self,
        factory: Address,
        factory_calldata: Bytes,
        to: Address,
        data: Bytes,
    ) -> Option<Bytes> {
        let mut scratch = self.db.clone();
        execute(&mut scratch, Address::ZERO, factory, factory_calldata, true)?;
        execute(&mut scratch, Address::ZERO, to, data, false)
    }
}

fn execute(
    db: &mut CacheDB<EmptyDB>,
    caller: Address,
    to: Address,
    data: Bytes,
    commit: bool,
) -> Option<Bytes> {
    let mut evm = Evm::builder()
        .with_db(db)
        .modify_tx_env(|tx| {
            tx.caller = caller;
            tx.transact_to = TxKind::Call(to);
            tx.data = data;
            tx.gas_limit = CALL_GAS_LIMIT;
        })
        .build();

    let result = if commit {
        evm.transact_commit()
    } else {
        evm.transact().map(|r| r.result)
    };

    match result {
        Ok(ExecutionResult::Success { output, .. }) => Some(output.into_data()),
        Ok(ExecutionResult::Revert { output, .. }) => {
            debug!(%to, ?output, "call reverted");
            None
        }
        Ok(ExecutionResult::Halt { reason, .. }) => {
            debug!(%to, ?reason, "call halted");
            None
        }
        Err(error) => {
            warn!(%to, ?error, "evm error");
            None
        }
    }
}
