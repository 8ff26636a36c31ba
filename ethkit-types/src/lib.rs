#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

pub mod block;
mod error;
mod rpc;

pub use block::{Block, BlockEvent, Header};
pub use error::RpcError;
pub use rpc::RpcSource;
pub use web3::types::{Address, Log, Transaction, H256, U256, U64};
