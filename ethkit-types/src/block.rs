//! The monitor's view of a single block: a header, its transactions, the
//! logs attached to it (if any), and the `Added`/`Removed` classification
//! assigned when it entered or left the retained chain.

use serde::{Deserialize, Serialize};
use web3::types::{Log, Transaction, H256, U256, U64};

/// Subset of a node's block header the monitor and its consumers care
/// about. Unlike `web3::types::Block`, every field here is required: a
/// header that is missing `number` or `hash` (e.g. a pending block) is
/// rejected before it ever becomes a [`Header`] — see
/// [`Header::try_from_web3`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub base_fee: Option<U256>,
    /// Carried through for downstream consumers (e.g. a gas gauge); the
    /// monitor itself never reads these.
    pub gas_used: U256,
    pub gas_limit: U256,
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("block header is missing its number")]
    NumberMissing,
    #[error("block header is missing its hash")]
    HashMissing,
}

impl Header {
    /// Builds a [`Header`] from a raw `web3` block, rejecting blocks that
    /// are not yet mined (no number/hash, e.g. the `pending` tag).
    pub fn try_from_web3<T>(block: &web3::types::Block<T>) -> Result<Self, HeaderError> {
        let number = block.number.ok_or(HeaderError::NumberMissing)?;
        let hash = block.hash.ok_or(HeaderError::HashMissing)?;
        Ok(Self {
            number: number.as_u64(),
            hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp.as_u64(),
            base_fee: block.base_fee_per_gas,
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
        })
    }
}

/// Classification assigned to a block the moment it is appended to, or
/// removed from, the monitor's retained chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockEvent {
    Added,
    Removed,
}

/// A block as it flows through the monitor: chain, publish queue, and
/// subscriber stream all move this same shape around.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    pub event: BlockEvent,
    /// `None` until logs are fetched, or permanently `None` when
    /// `with_logs = false` or the block is `Removed`.
    pub logs: Option<Vec<Log>>,
    /// True once the block is ready to publish: logs attached (or
    /// explicitly skipped), or the block is `Removed` (removals never
    /// need logs).
    pub ok: bool,
}

impl Block {
    pub fn new_added(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            event: BlockEvent::Added,
            logs: None,
            ok: false,
        }
    }

    /// Turns a retained `Added` block into the `Removed` event emitted
    /// for it during a reorg. Per this crate's resolution of the source's
    /// open question on removed-block logs, the emitted event always
    /// carries `logs: None`.
    pub fn into_removed(mut self) -> Self {
        self.event = BlockEvent::Removed;
        self.logs = None;
        self.ok = true;
        self
    }

    #[must_use]
    pub const fn is_added(&self) -> bool {
        matches!(self.event, BlockEvent::Added)
    }

    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self.event, BlockEvent::Removed)
    }

    #[must_use]
    pub const fn number(&self) -> u64 {
        self.header.number
    }

    #[must_use]
    pub const fn hash(&self) -> H256 {
        self.header.hash
    }

    #[must_use]
    pub const fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }
}
