//! Thin [`RpcSource`] implementation over a real `web3::Http` transport —
//! proves the capability trait is usable end-to-end, the way `block-watcher`
//! wires its own `web3::Eth` directly against a live node.

use async_trait::async_trait;
use ethkit_types::{RpcError, RpcSource};
use web3::{
    transports::Http,
    types::{Block, BlockId, BlockNumber, FilterBuilder, Log, Transaction, H256, U256, U64},
    Web3,
};

pub struct Web3RpcSource {
    web3: Web3<Http>,
}

impl Web3RpcSource {
    pub fn new(url: &str) -> Result<Self, web3::Error> {
        let transport = Http::new(url)?;
        Ok(Self { web3: Web3::new(transport) })
    }
}

fn to_rpc_error(err: web3::Error) -> RpcError {
    match err {
        web3::Error::Unreachable => RpcError::Timeout,
        other => RpcError::Transport(other.to_string()),
    }
}

#[async_trait]
impl RpcSource for Web3RpcSource {
    async fn chain_id(&self) -> Result<U256, RpcError> {
        self.web3.eth().chain_id().await.map_err(to_rpc_error)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let number = self.web3.eth().block_number().await.map_err(to_rpc_error)?;
        Ok(number.as_u64())
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block<Transaction>>, RpcError> {
        self.web3
            .eth()
            .block_with_txs(BlockId::Number(BlockNumber::Number(U64::from(number))))
            .await
            .map_err(to_rpc_error)
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<Transaction>>, RpcError> {
        self.web3
            .eth()
            .block_with_txs(BlockId::Hash(hash))
            .await
            .map_err(to_rpc_error)
    }

    /// `topics[0]`, if present, becomes the topic-0 filter; everything
    /// beyond that is ignored by this transport (the monitor only ever
    /// populates position 0 — see `MonitorOptions::log_topics`).
    async fn filter_logs(&self, block_hash: H256, topics: Vec<Vec<H256>>) -> Result<Vec<Log>, RpcError> {
        let mut builder = FilterBuilder::default().block_hash(block_hash);
        if let Some(topic0) = topics.first() {
            builder = builder.topics(Some(topic0.clone()), None, None, None);
        }
        self.web3.eth().logs(builder.build()).await.map_err(to_rpc_error)
    }
}
