//! Follows the custody's event log and applies confirmed events to the broker's store.

use std::{cmp, sync::Arc, time::Duration};

use anyhow::Result;
use custody::{
    chain::{CustodyCall, Log},
    crypto::SecretKey,
    state::BROKER,
};
use serde_json::json;
use tracing::*;

use crate::{
    cfg::Config,
    channels::{self, Applied, FollowUp},
    db::{Db, mark_event_processed},
    error::RpcError,
    ledger::{Account, Ledger},
    notify::{NotificationKind, Notifier},
    settlement::Settlement,
    time::unix_secs,
};

pub struct Synchronizer {
    db: Arc<Db>,
    settlement: Arc<dyn Settlement>,
    config: Arc<Config>,
    broker: SecretKey,
    notifier: Notifier,
}

impl Synchronizer {
    pub fn new(
        db: Arc<Db>,
        settlement: Arc<dyn Settlement>,
        config: Arc<Config>,
        broker: SecretKey,
        notifier: Notifier,
    ) -> Self {
        Synchronizer {
            db,
            settlement,
            config,
            broker,
            notifier,
        }
    }

    /// Backfills from the persisted cursor, then keeps polling. Failed rounds are retried with exponential backoff.
    pub async fn run(self) {
        let sync = &self.config.sync;
        let mut failures = 0;
        loop {
            match self.sync_once().await {
                Ok(_) => {
                    failures = 0;
                    tokio::time::sleep(sync.poll_interval).await;
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff(sync.retry_initial, sync.retry_max, failures);
                    warn!(%e, failures, ?delay, "sync round failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Applies every confirmed block after the cursor. Returns the block the cursor ends up at, if any has been
    /// processed yet.
    pub async fn sync_once(&self) -> Result<Option<u64>> {
        let head = self.settlement.head().await?;
        let target = head.number.saturating_sub(self.config.sync.confirmations);
        let mut cursor = self.db.sync_cursor()?;
        let batch_size = cmp::max(self.config.sync.batch_size, 1);

        loop {
            let from = cursor.map_or(0, |c| c + 1);
            if from > target {
                break;
            }
            let to = cmp::min(from.saturating_add(batch_size - 1), target);
            let logs = self.settlement.logs(from, to).await?;
            trace!(from, to, count = logs.len(), "fetched logs");
            for log in &logs {
                self.process(log).await?;
            }
            self.db.set_sync_cursor(to)?;
            cursor = Some(to);
        }
        Ok(cursor)
    }

    async fn process(&self, log: &Log) -> Result<()> {
        let now = unix_secs();
        let broker = self.broker.address();
        let result = self
            .db
            .with_transaction(|tx| channels::apply_log(tx, &self.config, broker, log, now));
        match result {
            Ok(applied) => {
                self.publish(&applied);
                for follow_up in applied.follow_ups {
                    self.follow_up(follow_up).await;
                }
                Ok(())
            }
            Err(RpcError::ChainReconciliation(reason)) => {
                error!(
                    block = log.block_number,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    %reason,
                    "event does not reconcile with the ledger"
                );
                self.skip(log, now).await?;
                // The round fails so the cursor stays behind this block until the retry, which skips the event.
                Err(RpcError::ChainReconciliation(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Marks an event that cannot be applied as processed and takes the affected channel's state from the chain.
    async fn skip(&self, log: &Log, now: u64) -> Result<()> {
        let record = match log.event.channel_id() {
            Some(channel_id) => Some((channel_id, self.settlement.channel(channel_id).await?)),
            None => None,
        };
        let channel = self.db.with_transaction(|tx| {
            mark_event_processed(tx, log.tx_hash, log.log_index, log.block_number)?;
            match &record {
                Some((channel_id, record)) => channels::resync(tx, *channel_id, record.as_ref(), now),
                None => Ok(None),
            }
        })?;
        if let Some(channel) = channel {
            self.notifier
                .notify(channel.wallet, NotificationKind::ChannelUpdate, &channel);
        }
        Ok(())
    }

    fn publish(&self, applied: &Applied) {
        if let Some(channel) = &applied.channel {
            self.notifier
                .notify(channel.wallet, NotificationKind::ChannelUpdate, channel);
        }
        for wallet in &applied.wallets {
            let balances = self
                .db
                .read(|conn| Ledger::new(conn, 0).balance_list(&Account::wallet(*wallet)));
            match balances {
                Ok(balances) => self.notifier.notify(
                    *wallet,
                    NotificationKind::BalanceUpdate,
                    &json!({ "balance_updates": balances }),
                ),
                Err(e) => warn!(%wallet, %e, "failed to read balances for notification"),
            }
        }
    }

    /// Sends a transaction the broker owes the chain. A failure is logged rather than retried: the wallet can still
    /// act on its own and a challenge is answered again on the next event.
    async fn follow_up(&self, follow_up: FollowUp) {
        let (what, call) = match follow_up {
            FollowUp::Join { channel_id, state } => (
                "join",
                CustodyCall::Join {
                    channel_id,
                    index: BROKER,
                    signature: FollowUp::join_signature(&self.broker, channel_id, &state),
                },
            ),
            FollowUp::Checkpoint { channel_id, state } => (
                "checkpoint",
                CustodyCall::Checkpoint {
                    channel_id,
                    candidate: state,
                    proofs: vec![],
                },
            ),
        };
        match self.settlement.submit(call).await {
            Ok(receipt) => info!(what, tx_hash = %receipt.tx_hash, "broker transaction confirmed"),
            Err(e) => warn!(what, %e, "broker transaction failed"),
        }
    }
}

/// How long [Synchronizer::run] waits after `failures` consecutive failed rounds.
pub fn backoff(initial: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    cmp::min(
        initial.saturating_mul(2u32.saturating_pow(failures - 1)),
        max,
    )
}
