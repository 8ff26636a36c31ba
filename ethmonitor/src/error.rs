use thiserror::Error;
use web3::types::H256;

use crate::{bootstrap::BootstrapError, chain::ChainError, queue::QueueError};
use ethkit_types::RpcError;

/// Fatal error returned by [`crate::Monitor::run`]. Anything recoverable
/// (`NotFound`, a bounded run of `Transport`/`Timeout` failures) is handled
/// inside the loop and never reaches here.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("rpc call did not complete within the configured timeout")]
    Timeout,

    #[error("reorg depth exceeded block_retention_limit; cannot rebuild the canonical chain")]
    ReorgExceedsRetention,

    #[error("log backfill for block {0} failed persistently")]
    LogsBackfillFailed(H256),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}
