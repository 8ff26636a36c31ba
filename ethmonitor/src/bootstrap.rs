//! Rebuild a [`Chain`](crate::chain::Chain) from a previously serialized
//! event sequence (spec component C7), e.g. one a consumer persisted from
//! its own subscription stream.

use ethkit_types::Block;
use thiserror::Error;

use crate::chain::{Chain, ChainError};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("bootstrap requires an empty, not-yet-running chain")]
    AlreadyInitialized,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Replays `events` (oldest first) into a fresh [`Chain`] of the given
/// capacity: each `Added` is a `push`, each `Removed` is a `pop`. When the
/// incoming sequence is larger than `retention_limit`, it is truncated from
/// the head — the oldest events are dropped, keeping only the tail that fits,
/// exactly as `Chain::push` would have retained them had they arrived live.
pub fn replay(events: Vec<Block>, retention_limit: usize) -> Result<Chain, BootstrapError> {
    let mut chain = Chain::new(retention_limit.max(1));
    let start = events.len().saturating_sub(retention_limit.max(1));
    for event in &events[start..] {
        if event.is_added() {
            chain.push(event.clone())?;
        } else {
            chain.pop()?;
        }
    }
    Ok(chain)
}
