//! The settlement layer: an escrow for two-party state channels and the signature schemes it accepts.

pub mod adjudicator;
pub mod chain;
pub mod crypto;
pub mod custody;
pub mod error;
pub mod evm;
pub mod sigverify;
pub mod state;

pub use custody::{ChannelRecord, Custody, CustodyConfig, CustodyEvent};
