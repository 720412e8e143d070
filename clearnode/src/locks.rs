//! Per-resource serialization of broker requests.
//!
//! Requests touching the same wallet, channel or app session are applied one at a time. A request takes every lock it
//! needs up front, in a global order, so two requests locking overlapping sets cannot deadlock.

use std::{fmt, sync::Arc};

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Wallet(Address),
    Channel(B256),
    AppSession(B256),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Wallet(address) => write!(f, "wallet:{address}"),
            LockKey::Channel(id) => write!(f, "channel:{id}"),
            LockKey::AppSession(id) => write!(f, "app:{id}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Locks {
    table: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Holds a set of locks until dropped. Entries nobody else holds or waits for are removed from the table on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    locks: &'a Locks,
    guards: Vec<(LockKey, OwnedMutexGuard<()>)>,
}

impl Locks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> LockGuard<'_> {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            // Clone the mutex out of the map so the shard lock is not held across the await.
            let mutex = self.table.entry(key).or_default().clone();
            guards.push((key, mutex.lock_owned().await));
        }
        LockGuard { locks: self, guards }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        for (key, guard) in self.guards.drain(..) {
            drop(guard);
            // The shard is write locked here, so no waiter can clone the mutex between the check and the removal.
            self.locks
                .table
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}
