//! The off-chain broker: unified balances backed by state channels, app sessions, and the RPC layer clients talk to.

pub mod app_session;
pub mod auth;
pub mod broker;
pub mod cfg;
pub mod channels;
pub mod db;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod notify;
pub mod rpc;
mod serde_util;
pub mod session_keys;
pub mod settlement;
pub mod sync;
pub mod time;
