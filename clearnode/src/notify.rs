//! Server-initiated notifications, fanned out to every connection authenticated as the recipient wallet.

use alloy::primitives::Address;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    BalanceUpdate,
    ChannelUpdate,
    Transfer,
    AppSessionUpdate,
}

impl NotificationKind {
    /// The method name on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            NotificationKind::BalanceUpdate => "bu",
            NotificationKind::ChannelUpdate => "cu",
            NotificationKind::Transfer => "tr",
            NotificationKind::AppSessionUpdate => "asu",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub wallet: Address,
    pub kind: NotificationKind,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Notifier {
            sender: broadcast::Sender::new(capacity),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn notify(&self, wallet: Address, kind: NotificationKind, params: &impl Serialize) {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!(%wallet, method = kind.method(), %e, "failed to serialize notification");
                return;
            }
        };
        // No receivers is fine: nobody is listening for this wallet right now.
        let _ = self.sender.send(Notification {
            wallet,
            kind,
            params,
        });
    }
}
