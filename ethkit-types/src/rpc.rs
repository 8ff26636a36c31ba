use async_trait::async_trait;
use web3::types::{Block as Web3Block, Log, Transaction, H256, U256, U64};

use crate::error::RpcError;

/// The one polymorphism boundary the monitor depends on: a narrow,
/// object-safe capability interface over whatever JSON-RPC transport and
/// method bindings `ethkit`'s RPC client provides. Implementations may be
/// mocked (tests), in-process, or a real `web3`/`jsonrpsee` transport —
/// the monitor never knows the difference.
#[async_trait]
pub trait RpcSource: Send + Sync + 'static {
    async fn chain_id(&self) -> Result<U256, RpcError>;

    async fn block_number(&self) -> Result<u64, RpcError>;

    /// `Ok(None)` means the node has no block at this height yet — the
    /// benign, silently-retried `NotFound` case in spec §7.
    async fn block_by_number(
        &self,
        number: u64,
    ) -> Result<Option<Web3Block<Transaction>>, RpcError>;

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Web3Block<Transaction>>, RpcError>;

    /// `topics[i]` is an OR-set of accepted values for topic position `i`;
    /// an empty outer list means "no topic filter, return all logs".
    async fn filter_logs(
        &self,
        block_hash: H256,
        topics: Vec<Vec<H256>>,
    ) -> Result<Vec<Log>, RpcError>;
}

/// Helper used by every `RpcSource` implementation: converts the raw
/// block-number type JSON-RPC encodes to into a plain `u64`.
#[must_use]
pub fn u64_from(value: U64) -> u64 {
    value.as_u64()
}
