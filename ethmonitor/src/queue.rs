//! Ordered buffer of unpublished events (spec component C3): collapses
//! `Added`/`Removed` pairs that never escaped the queue, and only ever
//! dequeues a fully-ready, `Added`-terminated prefix.

use std::collections::VecDeque;

use ethkit_types::{Block, Log, H256};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity and cannot accept the batch. Per spec.md
    /// §7 this is fatal: the monitor loop exits and the caller must
    /// restart it.
    #[error("publish queue is at capacity")]
    Full,

    /// A `Removed(b)` arrived whose tail is an `Added(b')` for a
    /// *different* block. Per spec.md §4.2 the only valid pairings are an
    /// unescaped matching `Added`/`Removed` (which cancels instead of
    /// enqueuing) or a tail that is empty or already `Removed`; anything
    /// else is a programming error upstream, not a data condition this
    /// queue can recover from.
    #[error("removed block does not match the unescaped added block at the tail of the queue")]
    MismatchedRemoval,
}

#[derive(Debug)]
pub struct PublishQueue {
    capacity: usize,
    entries: VecDeque<Block>,
}

impl PublishQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a batch of events produced in one monitor-loop iteration,
    /// applying the enqueue policy in spec.md §4.2 to each event in turn.
    pub fn enqueue(&mut self, events: impl IntoIterator<Item = Block>) -> Result<(), QueueError> {
        for event in events {
            self.enqueue_one(event)?;
        }
        Ok(())
    }

    fn enqueue_one(&mut self, event: Block) -> Result<(), QueueError> {
        if event.is_removed() {
            if let Some(tail) = self.entries.back() {
                if tail.is_added() {
                    if tail.hash() != event.hash() {
                        return Err(QueueError::MismatchedRemoval);
                    }
                    // The addition never escaped the queue: cancel it.
                    self.entries.pop_back();
                    return Ok(());
                }
            }
        }
        if self.entries.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        self.entries.push_back(event);
        Ok(())
    }

    /// Returns and removes the longest contiguous ready prefix: every
    /// entry in it has `ok == true`, none exceeds `max_block_num` (when
    /// nonzero), and the prefix's last entry is an `Added` — a trailing
    /// `Removed` is held back until the next `Added` joins it, so
    /// consumers never observe an ambiguous mid-reorg cut point.
    pub fn dequeue(&mut self, max_block_num: u64) -> Vec<Block> {
        let mut cut = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.ok || (max_block_num > 0 && entry.number() > max_block_num) {
                break;
            }
            if entry.is_added() {
                cut = i + 1;
            }
        }
        self.entries.drain(..cut).collect()
    }

    /// Used by the log backfiller (C6): if `hash` is still a pending
    /// `Added` entry in this queue, attaches its logs and marks it ready,
    /// mirroring `Chain::set_logs`. A block that already left the queue
    /// (dequeued and delivered, necessarily already `ok == true`) has
    /// nothing here to update, so this is a no-op for it.
    pub(crate) fn set_logs(&mut self, hash: H256, logs: Vec<Log>) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.is_added() && e.hash() == hash) {
            entry.logs = Some(logs);
            entry.ok = true;
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

    fn added(number: u64, hash: u8, ok: bool) -> Block {
        let mut b = Block::new_added(
            Header {
                number,
                hash: H256::repeat_byte(hash),
                parent_hash: H256::zero(),
                timestamp: 0,
                base_fee: None,
                gas_used: U256::zero(),
                gas_limit: U256::zero(),
            },
            vec![],
        );
        b.ok = ok;
        b
    }

    #[test]
    fn removed_cancels_matching_unescaped_added() {
        let mut queue = PublishQueue::new(10);
        let a = added(1, 1, true);
        let hash = a.hash();
        queue.enqueue_one(a).unwrap();
        let mut removed = added(1, 1, true);
        removed.event = ethkit_types::BlockEvent::Removed;
        assert_eq!(removed.hash(), hash);
        queue.enqueue_one(removed).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn removed_appends_when_queue_is_empty() {
        // The block was already dequeued and delivered in an earlier
        // batch; the queue has nothing about it, but the Removed event
        // still needs to be enqueued so subscribers learn it unwound.
        let mut queue = PublishQueue::new(10);
        let mut removed = added(2, 2, true);
        removed.event = ethkit_types::BlockEvent::Removed;
        queue.enqueue_one(removed).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn removed_appends_behind_a_trailing_removed() {
        let mut queue = PublishQueue::new(10);
        let mut removed_a = added(1, 1, true);
        removed_a.event = ethkit_types::BlockEvent::Removed;
        queue.enqueue_one(removed_a).unwrap();
        let mut removed_b = added(2, 2, true);
        removed_b.event = ethkit_types::BlockEvent::Removed;
        queue.enqueue_one(removed_b).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn removed_against_a_mismatched_added_tail_is_an_error() {
        let mut queue = PublishQueue::new(10);
        queue.enqueue_one(added(1, 1, true)).unwrap();
        let mut removed = added(2, 2, true);
        removed.event = ethkit_types::BlockEvent::Removed;
        assert_eq!(
            queue.enqueue_one(removed).unwrap_err(),
            QueueError::MismatchedRemoval
        );
        // The mismatched pairing is rejected without mutating the queue.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn dequeue_stops_before_trailing_removed() {
        let mut queue = PublishQueue::new(10);
        queue.enqueue_one(added(1, 1, true)).unwrap();
        let mut removed = added(2, 2, true);
        removed.event = ethkit_types::BlockEvent::Removed;
        queue.enqueue_one(removed).unwrap();

        let ready = queue.dequeue(0);
        assert!(ready.is_empty(), "must hold back until an Added joins the Removed");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_only_ready_prefix() {
        let mut queue = PublishQueue::new(10);
        queue.enqueue_one(added(1, 1, true)).unwrap();
        queue.enqueue_one(added(2, 2, false)).unwrap();
        queue.enqueue_one(added(3, 3, true)).unwrap();

        let ready = queue.dequeue(0);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].number(), 1);
        assert_eq!(queue.len(), 2, "blocks after a not-yet-ok entry stay queued");
    }

    #[test]
    fn dequeue_honors_max_block_num() {
        let mut queue = PublishQueue::new(10);
        queue.enqueue_one(added(1, 1, true)).unwrap();
        queue.enqueue_one(added(2, 2, true)).unwrap();
        queue.enqueue_one(added(3, 3, true)).unwrap();

        let ready = queue.dequeue(2);
        assert_eq!(ready.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_past_capacity_is_fatal() {
        let mut queue = PublishQueue::new(1);
        queue.enqueue_one(added(1, 1, true)).unwrap();
        assert_eq!(
            queue.enqueue_one(added(2, 2, true)).unwrap_err(),
            QueueError::Full
        );
    }

    proptest::proptest! {
        /// Universal invariant from spec.md §8: the dequeued prefix never
        /// includes a not-yet-`ok` entry, and (since every entry here is
        /// `Added`) its length always lands exactly at the first `false`.
        #[test]
        fn dequeue_never_returns_past_the_first_not_ok_entry(ok_flags in proptest::collection::vec(proptest::bool::ANY, 0..40)) {
            let mut queue = PublishQueue::new(1000);
            for (i, ok) in ok_flags.iter().enumerate() {
                queue.enqueue_one(added(i as u64 + 1, (i % 250) as u8, *ok)).unwrap();
            }
            let ready = queue.dequeue(0);
            proptest::prop_assert!(ready.iter().all(|b| b.ok));
            if let Some(last) = ready.last() {
                proptest::prop_assert!(last.is_added());
            }
            let expected = ok_flags.iter().position(|ok| !ok).unwrap_or(ok_flags.len());
            proptest::prop_assert_eq!(ready.len(), expected);
        }
    }
}
