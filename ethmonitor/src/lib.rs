#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

//! `ethmonitor` follows the canonical chain produced by an untrusted
//! remote node: it detects and replays reorganizations, optionally
//! attaches per-block event logs, buffers an ordered stream of block
//! events, and fans them out to many concurrent subscribers with bounded
//! back-pressure and a configurable trail-behind-head finality window.

mod backfill;
mod bootstrap;
mod chain;
mod error;
mod monitor;
mod queue;
mod statistics;
mod subscriber;

pub use bootstrap::BootstrapError;
pub use chain::{Chain, ChainError, ChainSnapshot};
pub use error::MonitorError;
pub use ethkit_types::{Block, BlockEvent, Header, RpcError, RpcSource};
pub use monitor::{Monitor, MonitorOptions};
pub use queue::{PublishQueue, QueueError};
pub use subscriber::Subscription;

#[cfg(test)]
pub(crate) mod test_support;
