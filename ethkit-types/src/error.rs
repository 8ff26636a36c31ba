use thiserror::Error;

/// Errors an [`RpcSource`](crate::RpcSource) implementation may return.
/// `NotFound` is deliberately not a variant here: both `block_by_number`
/// and `block_by_hash` model it as `Ok(None)`, matching the
/// `Option<Block>` shape a JSON-RPC `eth_getBlockBy*` call already
/// returns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc request timed out")]
    Timeout,
}
