//! Log backfiller (spec component C6): retries `filter_logs` for blocks
//! still marked `ok == false` across the retained window.

use std::{future::Future, sync::Mutex};

use web3::types::{Log, H256};

use crate::{chain::Chain, queue::PublishQueue};

/// Outcome of one backfill pass: `recovered` blocks are now `ok == true`
/// everywhere they're tracked; `still_failing` blocks were attempted this
/// pass and remain `ok == false`, for the caller to feed into its own
/// consecutive-failure accounting.
pub(crate) struct BackfillOutcome {
    pub recovered: Vec<H256>,
    pub still_failing: Vec<H256>,
}

/// Walks retained blocks newest-to-oldest and retries a log fetch for every
/// `Added` block still marked `ok == false`, updating it in place on
/// success — both in the retained `Chain` and, if the block is still
/// sitting unpublished in `queue`, in its queued entry too. Without the
/// latter, a block enqueued before its logs were available would stay
/// `ok == false` in the queue forever: the queue holds its own clone, and
/// only it (not `Chain`) gates `dequeue`. Idempotent: a block that already
/// has logs, or that is `Removed`, is skipped. The blocks themselves are
/// not republished here, they simply become eligible for the next normal
/// `dequeue`.
pub(crate) async fn run<F, Fut>(chain: &Mutex<Chain>, queue: &Mutex<PublishQueue>, mut fetch_logs: F) -> BackfillOutcome
where
    F: FnMut(H256) -> Fut,
    Fut: Future<Output = Option<Vec<Log>>>,
{
    let pending: Vec<H256> = {
        let chain = chain.lock().unwrap();
        chain
            .blocks()
            .into_iter()
            .rev()
            .filter(|b| b.is_added() && !b.ok)
            .map(|b| b.hash())
            .collect()
    };

    let mut recovered = Vec::with_capacity(pending.len());
    let mut still_failing = Vec::new();
    for hash in pending {
        match fetch_logs(hash).await {
            Some(logs) => {
                let found_in_chain = chain.lock().unwrap().set_logs(hash, logs.clone());
                queue.lock().unwrap().set_logs(hash, logs);
                if found_in_chain {
                    recovered.push(hash);
                }
            }
            None => still_failing.push(hash),
        }
    }
    BackfillOutcome { recovered, still_failing }
}

#[cfg(test)]
mod tests {
    use ethkit_types::{Block, Header};
    use web3::types::U256;

    use super::*;

    fn block_with(number: u64, hash: u8, ok: bool) -> Block {
        let mut b = Block::new_added(
            Header {
                number,
                hash: H256::repeat_byte(hash),
                parent_hash: H256::zero(),
                timestamp: number,
                base_fee: None,
                gas_used: U256::zero(),
                gas_limit: U256::zero(),
            },
            vec![],
        );
        b.ok = ok;
        b
    }

    #[tokio::test]
    async fn backfills_only_not_ok_added_blocks() {
        let mut chain = Chain::new(10);
        chain.push(block_with(1, 1, true)).unwrap();
        chain.push(block_with(2, 2, false)).unwrap();
        let chain = Mutex::new(chain);
        let queue = Mutex::new(PublishQueue::new(10));

        let outcome = run(&chain, &queue, |hash| async move {
            if hash == H256::repeat_byte(2) {
                Some(vec![])
            } else {
                panic!("block 1 was already ok, must not be refetched")
            }
        })
        .await;

        assert_eq!(outcome.recovered, vec![H256::repeat_byte(2)]);
        assert!(outcome.still_failing.is_empty());
        assert!(chain.lock().unwrap().get_by_hash(H256::repeat_byte(2)).unwrap().ok);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_block_pending() {
        let mut chain = Chain::new(10);
        chain.push(block_with(1, 1, false)).unwrap();
        let chain = Mutex::new(chain);
        let queue = Mutex::new(PublishQueue::new(10));

        let outcome = run(&chain, &queue, |_hash| async { None }).await;

        assert!(outcome.recovered.is_empty());
        assert_eq!(outcome.still_failing, vec![H256::repeat_byte(1)]);
        assert!(!chain.lock().unwrap().get_by_hash(H256::repeat_byte(1)).unwrap().ok);
    }

    #[tokio::test]
    async fn successful_backfill_also_updates_the_still_queued_entry() {
        let mut chain = Chain::new(10);
        chain.push(block_with(1, 1, false)).unwrap();
        let chain = Mutex::new(chain);

        let mut queue = PublishQueue::new(10);
        queue.enqueue_one(block_with(1, 1, false)).unwrap();
        let queue = Mutex::new(queue);

        let outcome = run(&chain, &queue, |_hash| async { Some(vec![]) }).await;

        assert_eq!(outcome.recovered, vec![H256::repeat_byte(1)]);
        let ready = queue.lock().unwrap().dequeue(0);
        assert_eq!(ready.len(), 1, "the queued entry must also become ready, not just the retained one");
        assert!(ready[0].ok);
    }
}
