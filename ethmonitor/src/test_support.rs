//! In-memory [`RpcSource`] double used by unit and scenario tests: lets a
//! test script an exact sequence of blocks (including reorg forks) and
//! log-fetch failures without touching a real node.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use ethkit_types::{RpcError, RpcSource};
use web3::types::{Block as Web3Block, Log, Transaction, H256, U256, U64};

#[derive(Default)]
struct State {
    by_number: HashMap<u64, Web3Block<Transaction>>,
    by_hash: HashMap<H256, Web3Block<Transaction>>,
    log_scripts: HashMap<H256, VecDeque<Result<Vec<Log>, RpcError>>>,
    block_number: u64,
}

#[derive(Default)]
pub struct MockRpcSource {
    state: Mutex<State>,
}

impl MockRpcSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `block` under both its number and hash, advancing the
    /// mock's `block_number()` if this is the new tip. Calling this again
    /// for a number that's already registered overwrites it — the way a
    /// test scripts a reorg: the node now answers differently for a
    /// height it already served.
    pub fn insert(&self, block: Web3Block<Transaction>) {
        let mut state = self.state.lock().unwrap();
        let number = block.number.expect("test block must have a number").as_u64();
        let hash = block.hash.expect("test block must have a hash");
        state.block_number = state.block_number.max(number);
        state.by_number.insert(number, block.clone());
        state.by_hash.insert(hash, block);
    }

    /// Scripts the sequence of outcomes `filter_logs` returns for
    /// `hash`, one per call; the last entry repeats once exhausted.
    pub fn script_logs(&self, hash: H256, outcomes: Vec<Result<Vec<Log>, RpcError>>) {
        self.state
            .lock()
            .unwrap()
            .log_scripts
            .insert(hash, outcomes.into_iter().collect());
    }
}

#[async_trait]
impl RpcSource for MockRpcSource {
    async fn chain_id(&self) -> Result<U256, RpcError> {
        Ok(U256::from(1))
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn block_by_number(
        &self,
        number: u64,
    ) -> Result<Option<Web3Block<Transaction>>, RpcError> {
        Ok(self.state.lock().unwrap().by_number.get(&number).cloned())
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Web3Block<Transaction>>, RpcError> {
        Ok(self.state.lock().unwrap().by_hash.get(&hash).cloned())
    }

    async fn filter_logs(
        &self,
        block_hash: H256,
        _topics: Vec<Vec<H256>>,
    ) -> Result<Vec<Log>, RpcError> {
        let mut state = self.state.lock().unwrap();
        let Some(script) = state.log_scripts.get_mut(&block_hash) else {
            return Ok(Vec::new());
        };
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Ok(Vec::new()))
        }
    }
}

/// Builds a minimal but well-formed `web3` block for tests: every field
/// not named here takes its `Default`, which is fine since the monitor
/// only reads the ones [`ethkit_types::Header::try_from_web3`] copies out.
#[must_use]
pub fn block(number: u64, hash: H256, parent_hash: H256, transactions: Vec<Transaction>) -> Web3Block<Transaction> {
    Web3Block {
        hash: Some(hash),
        parent_hash,
        number: Some(U64::from(number)),
        timestamp: U256::from(number),
        transactions,
        ..Default::default()
    }
}

#[must_use]
pub fn transaction(hash: H256) -> Transaction {
    Transaction {
        hash,
        ..Default::default()
    }
}
