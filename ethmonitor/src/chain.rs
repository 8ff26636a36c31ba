//! In-memory ring buffer of retained canonical blocks (spec component C2).
//! Owned exclusively by the monitor loop; every operation here is
//! serialized by the single lock the `Monitor` wraps it in — readers get
//! a copy-on-return snapshot rather than a guard they could hold across
//! an `.await`.

use std::collections::VecDeque;

use ethkit_types::{Block, Transaction, H256, Log};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block parent hash does not match the retained head")]
    UnexpectedParentHash,
    #[error("block number does not extend the retained head by one")]
    UnexpectedBlockNumber,
    #[error("pop on an empty chain")]
    Empty,
}

/// A shallow, owned copy of the blocks `Chain` currently retains, oldest
/// first. Safe to hold across `.await` points since it owns no lock.
pub type ChainSnapshot = Vec<Block>;

/// Append-only-with-tail-pop ordered sequence of retained blocks.
#[derive(Debug, Default)]
pub struct Chain {
    capacity: usize,
    /// Oldest block at the front, newest (current head) at the back.
    blocks: VecDeque<Block>,
}

impl Chain {
    /// `capacity` should be `block_retention_limit + trail_num_blocks_behind_head`
    /// so invariant (2) in spec.md §3 ("retention length ≤ retention_limit +
    /// trail_behind") holds without the monitor having to police it itself.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            blocks: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Appends `block` as the new head. Evicts the oldest retained block
    /// first if already at capacity. Fails if `block` does not extend the
    /// current head per the linkage invariants in spec.md §3 (skipped
    /// entirely when the chain is empty: any block may seed it).
    pub fn push(&mut self, block: Block) -> Result<(), ChainError> {
        if let Some(head) = self.blocks.back() {
            if block.number() != head.number() + 1 {
                return Err(ChainError::UnexpectedBlockNumber);
            }
            if block.parent_hash() != head.hash() {
                return Err(ChainError::UnexpectedParentHash);
            }
        }
        if self.blocks.len() >= self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
        Ok(())
    }

    /// Removes and returns the head (newest) block. Only fails if the
    /// chain is empty, which is a programming error: callers must check
    /// `head()`/`is_empty()` (or simply not reorg an empty chain) first.
    pub fn pop(&mut self) -> Result<Block, ChainError> {
        self.blocks.pop_back().ok_or(ChainError::Empty)
    }

    #[must_use]
    pub fn head(&self) -> Option<&Block> {
        self.blocks.back()
    }

    #[must_use]
    pub fn blocks(&self) -> ChainSnapshot {
        self.blocks.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Newest-first linear search by block hash.
    #[must_use]
    pub fn get_by_hash(&self, hash: H256) -> Option<Block> {
        self.blocks.iter().rev().find(|b| b.hash() == hash).cloned()
    }

    /// Newest-first scan across retained blocks' transactions.
    #[must_use]
    pub fn get_transaction(&self, hash: H256) -> Option<Transaction> {
        self.blocks
            .iter()
            .rev()
            .find_map(|b| b.transactions.iter().find(|t| t.hash == hash).cloned())
    }

    /// Used by the log backfiller (C6): updates a retained block's logs
    /// in place once a retry succeeds, without disturbing its position.
    pub fn set_logs(&mut self, hash: H256, logs: Vec<Log>) -> bool {
        if let Some(block) = self.blocks.iter_mut().find(|b| b.hash() == hash) {
            block.logs = Some(logs);
            block.ok = true;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use ethkit_types::Header;
    use web3::types::{H256, U256};

    use super::*;

    fn block(number: u64, hash: u8, parent: u8) -> Block {
        Block::new_added(
            Header {
                number,
                hash: H256::repeat_byte(hash),
                parent_hash: H256::repeat_byte(parent),
                timestamp: number,
                base_fee: None,
                gas_used: U256::zero(),
                gas_limit: U256::zero(),
            },
            vec![],
        )
    }

    #[test]
    fn push_seeds_an_empty_chain_with_any_block() {
        let mut chain = Chain::new(10);
        assert!(chain.push(block(5, 5, 4)).is_ok());
        assert_eq!(chain.head().unwrap().number(), 5);
    }

    #[test]
    fn push_rejects_broken_linkage() {
        let mut chain = Chain::new(10);
        chain.push(block(1, 1, 0)).unwrap();
        assert_eq!(
            chain.push(block(3, 3, 1)).unwrap_err(),
            ChainError::UnexpectedBlockNumber
        );
        assert_eq!(
            chain.push(block(2, 2, 99)).unwrap_err(),
            ChainError::UnexpectedParentHash
        );
    }

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut chain = Chain::new(2);
        chain.push(block(1, 1, 0)).unwrap();
        chain.push(block(2, 2, 1)).unwrap();
        chain.push(block(3, 3, 2)).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain.get_by_hash(H256::repeat_byte(1)).is_none());
        assert!(chain.get_by_hash(H256::repeat_byte(3)).is_some());
    }

    #[test]
    fn pop_on_empty_chain_errors() {
        let mut chain = Chain::new(10);
        assert_eq!(chain.pop().unwrap_err(), ChainError::Empty);
    }

    #[test]
    fn get_by_hash_is_newest_first() {
        let mut chain = Chain::new(10);
        chain.push(block(1, 1, 0)).unwrap();
        chain.push(block(2, 2, 1)).unwrap();
        assert_eq!(chain.get_by_hash(H256::repeat_byte(2)).unwrap().number(), 2);
        assert!(chain.get_by_hash(H256::repeat_byte(9)).is_none());
    }
}
