//! The protocol state machine (spec component C5): polls an [`RpcSource`],
//! extends or reorganizes the retained chain, optionally attaches logs,
//! publishes ready batches, and fans them out to subscribers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ethkit_types::{Block, Header, RpcError, RpcSource, Transaction};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use web3::types::{Log, H256};

use crate::{
    backfill,
    bootstrap::{self, BootstrapError},
    chain::{Chain, ChainSnapshot},
    error::MonitorError,
    queue::PublishQueue,
    statistics::{
        BLOCKS_ADDED, BLOCKS_REMOVED, BLOCK_HEADER_LATENCY, LOG_FETCH_FAILURES, REORG_DEPTH,
    },
    subscriber::{SubscriberRegistry, Subscription},
};

/// Bounded retry budget for `Transport`/`Timeout` RPC failures before an
/// iteration gives up and surfaces the error, mirroring `block-watcher`'s
/// `MAX_TRIES`/`RETRY_DELAY` pair.
const MAX_TRIES: usize = 20;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Consecutive failed backfill passes for the same block before it's
/// reported via `MonitorError::LogsBackfillFailed` (non-fatally — the
/// block just stays `ok == false` and is retried again next tick).
const BACKFILL_FAILURE_THRESHOLD: u32 = 5;

/// Tunable behavior of a [`Monitor`] instance. `Default` matches the
/// defaults enumerated in spec §6.
#[derive(Clone, Debug)]
pub struct MonitorOptions {
    pub polling_interval: Duration,
    pub timeout: Duration,
    pub start_block_number: Option<u64>,
    pub trail_num_blocks_behind_head: u64,
    pub block_retention_limit: usize,
    pub with_logs: bool,
    /// Filter restricting `filter_logs` to these topic-0 values; empty
    /// means "no filter, fetch all logs" (spec §6).
    pub log_topics: Vec<H256>,
    pub strict_subscribers: bool,
    pub debug_logging: bool,
    /// Supplemented: `PublishQueue` capacity. Spec §4.2 defaults this to
    /// `2 * block_retention_limit`.
    pub publish_queue_capacity: usize,
    /// Supplemented: informational threshold for the per-subscriber
    /// buffer-depth warning (spec §4.4 / §5).
    pub buffer_limit_warning: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        let block_retention_limit = 200;
        Self {
            polling_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            start_block_number: None,
            trail_num_blocks_behind_head: 0,
            block_retention_limit,
            with_logs: false,
            log_topics: Vec::new(),
            strict_subscribers: true,
            debug_logging: false,
            publish_queue_capacity: block_retention_limit * 2,
            buffer_limit_warning: 4096,
        }
    }
}

/// Outcome of fetching a single block, collapsing the RPC's `NotFound`
/// case and cancellation into distinct, non-error variants: neither is a
/// failure, both just mean "nothing to do this iteration".
enum FetchOutcome<T> {
    Found(T),
    NotFound,
    Cancelled,
}

/// Whether a retried RPC call completed or cancellation fired first.
enum Fetch<T> {
    Ready(T),
    Cancelled,
}

/// Follows the canonical chain exposed by `rpc`, detecting and replaying
/// reorgs, and republishes the resulting event stream to every subscriber.
/// A single instance may only have one `run()` in flight at a time.
pub struct Monitor {
    rpc: Arc<dyn RpcSource>,
    options: MonitorOptions,
    chain: Mutex<Chain>,
    queue: Mutex<PublishQueue>,
    subscribers: SubscriberRegistry,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    /// Consecutive failed backfill passes per block, for
    /// `BACKFILL_FAILURE_THRESHOLD` reporting. Pruned each tick against
    /// the retained chain so a block that falls out of retention doesn't
    /// linger here forever.
    backfill_attempts: Mutex<HashMap<H256, u32>>,
}

impl Monitor {
    #[must_use]
    pub fn new(rpc: Arc<dyn RpcSource>, options: MonitorOptions) -> Self {
        let retention = options.block_retention_limit + options.trail_num_blocks_behind_head as usize;
        Self {
            subscribers: SubscriberRegistry::new(options.strict_subscribers, options.buffer_limit_warning),
            chain: Mutex::new(Chain::new(retention)),
            queue: Mutex::new(PublishQueue::new(options.publish_queue_capacity)),
            rpc,
            options,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            backfill_attempts: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &MonitorOptions {
        &self.options
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Rebuilds the retained chain from a previously serialized event
    /// sequence (spec §4.6). Only valid before the first `run()`.
    pub fn bootstrap(&self, events: Vec<Block>) -> Result<(), MonitorError> {
        if self.is_running() {
            return Err(BootstrapError::AlreadyInitialized.into());
        }
        let mut chain = self.chain.lock().unwrap();
        if !chain.is_empty() {
            return Err(BootstrapError::AlreadyInitialized.into());
        }
        *chain = bootstrap::replay(events, self.options.block_retention_limit)?;
        Ok(())
    }

    /// Signals cancellation to the currently running loop, if any, and
    /// returns immediately. A no-op when the monitor isn't running.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe().await
    }

    #[must_use]
    pub fn latest_block(&self) -> Option<Block> {
        self.chain.lock().unwrap().head().cloned()
    }

    #[must_use]
    pub fn get_block(&self, hash: H256) -> Option<Block> {
        self.chain.lock().unwrap().get_by_hash(hash)
    }

    #[must_use]
    pub fn get_transaction(&self, hash: H256) -> Option<Transaction> {
        self.chain.lock().unwrap().get_transaction(hash)
    }

    #[must_use]
    pub fn chain(&self) -> ChainSnapshot {
        self.chain.lock().unwrap().blocks()
    }

    pub async fn num_subscribers(&self) -> usize {
        self.subscribers.num_subscribers().await
    }

    /// Runs the monitor loop until `cancel` fires or a fatal error occurs.
    /// Rejects a second concurrent call with `AlreadyRunning`. Shutdown is
    /// always deterministic: every subscriber forwarder task is joined
    /// before this returns, regardless of how the loop ended.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyRunning);
        }
        *self.cancel.lock().unwrap() = Some(cancel.clone());
        info!(
            polling_interval = ?self.options.polling_interval,
            retention_limit = self.options.block_retention_limit,
            with_logs = self.options.with_logs,
            "starting monitor loop"
        );

        let result = self.run_loop(&cancel).await;

        self.subscribers.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        *self.cancel.lock().unwrap() = None;
        debug!(?result, "monitor loop exited");
        result
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<(), MonitorError> {
        while !cancel.is_cancelled() {
            self.tick(cancel).await?;
        }
        Ok(())
    }

    /// One iteration of the loop: spec §4.3 steps (i)–(vii).
    async fn tick(&self, cancel: &CancellationToken) -> Result<(), MonitorError> {
        // (i) choose next block number
        let current_head = { self.chain.lock().unwrap().head().cloned() };
        let next = match &current_head {
            Some(head) => head.number() + 1,
            None => match self.options.start_block_number {
                Some(n) => n,
                None => match self.fetch_latest_block_number(cancel).await? {
                    Some(n) => n,
                    None => return Ok(()),
                },
            },
        };

        // (ii) fetch candidate
        let candidate = match self.fetch_by_number(next, cancel).await? {
            FetchOutcome::Found(block) => block,
            FetchOutcome::NotFound => {
                if self.options.debug_logging {
                    debug!(number = next, "candidate block not yet available");
                }
                self.sleep_or_cancel(cancel).await;
                return Ok(());
            }
            FetchOutcome::Cancelled => return Ok(()),
        };
        if self.options.debug_logging {
            debug!(number = candidate.number(), hash = ?candidate.hash(), "fetched candidate block");
        }

        // (iii) extend or reorganize
        let mut events = Vec::new();
        let outcome = self.extend_or_reorg(candidate, &mut events, cancel).await;

        // (iv) attach logs — only meaningful once the rebuild fully
        // succeeded; a partial/failed rebuild only ever produced `Removed`
        // events, which never need logs.
        let fully_extended = matches!(&outcome, Ok(true));
        if fully_extended {
            if self.options.with_logs {
                self.attach_logs(&mut events, cancel).await;
            } else {
                for event in &mut events {
                    if event.is_added() {
                        event.ok = true;
                    }
                }
            }
        }

        if !events.is_empty() {
            self.queue.lock().unwrap().enqueue(events)?;
        }

        if !outcome? {
            return Ok(());
        }

        // (v) backfill
        if self.options.with_logs {
            let rpc = &*self.rpc;
            let topics = self.log_topic_filter();
            let outcome = backfill::run(&self.chain, &self.queue, |hash| async move {
                fetch_logs_once(rpc, hash, topics.clone(), self.options.timeout).await
            })
            .await;
            if !outcome.recovered.is_empty() {
                debug!(count = outcome.recovered.len(), "backfilled block logs");
            }
            self.track_backfill_attempts(&outcome.recovered, &outcome.still_failing);
        }

        // (vi) enqueue & publish
        let max_block_num = if self.options.trail_num_blocks_behind_head > 0 {
            let head_number = self.chain.lock().unwrap().head().map(Block::number).unwrap_or(0);
            head_number.saturating_sub(self.options.trail_num_blocks_behind_head)
        } else {
            0
        };
        let ready = self.queue.lock().unwrap().dequeue(max_block_num);
        if !ready.is_empty() {
            self.subscribers.broadcast(ready).await;
        }

        // (vii) loop wait
        self.sleep_or_cancel(cancel).await;
        Ok(())
    }

    /// Implements step (iii): classifies `candidate` as a linear extension
    /// or the tip of a reorg, rebuilding the canonical chain iteratively
    /// (not recursively) and bounded by `block_retention_limit`, appending
    /// every resulting event to `events` in chain order. Returns `Ok(true)`
    /// once the chain has been fully extended through `candidate`,
    /// `Ok(false)` if an ancestor fetch came back empty or cancellation
    /// fired mid-rebuild (the caller should simply retry next tick — any
    /// `Removed` events already appended to `events` are still enqueued by
    /// the caller so the chain and the publish stream never disagree).
    async fn extend_or_reorg(
        &self,
        candidate: Block,
        events: &mut Vec<Block>,
        cancel: &CancellationToken,
    ) -> Result<bool, MonitorError> {
        let head = { self.chain.lock().unwrap().head().cloned() };
        let is_linear_extension = match &head {
            None => true,
            Some(head) => candidate.parent_hash() == head.hash(),
        };
        if is_linear_extension {
            self.chain.lock().unwrap().push(candidate.clone())?;
            BLOCKS_ADDED.inc();
            events.push(candidate);
            return Ok(true);
        }
        let head = head.expect("checked above: None took the linear-extension branch");

        warn!(
            candidate_number = candidate.number(),
            candidate_hash = ?candidate.hash(),
            head_number = head.number(),
            "reorg detected, rebuilding canonical chain"
        );

        let mut ancestors = vec![candidate];
        let mut popped = 0usize;
        loop {
            if ancestors.len() > self.options.block_retention_limit {
                return Err(MonitorError::ReorgExceedsRetention);
            }

            let current_head = { self.chain.lock().unwrap().head().cloned() };
            let Some(current_head) = current_head else {
                break;
            };
            let oldest_pending = ancestors.last().expect("ancestors is never empty");

            if oldest_pending.hash() == current_head.hash() {
                // The fetched ancestor is already the retained head: it's
                // a duplicate, not a new ancestor to push.
                ancestors.pop();
                break;
            }
            if oldest_pending.parent_hash() == current_head.hash() {
                break;
            }

            let removed = { self.chain.lock().unwrap().pop()? };
            popped += 1;
            BLOCKS_REMOVED.inc();
            events.push(removed.into_removed());

            if self.sleep_or_cancel(cancel).await {
                return Ok(false);
            }

            let parent_hash = oldest_pending.parent_hash();
            let parent = match self.fetch_by_hash(parent_hash, cancel).await? {
                FetchOutcome::Found(block) => block,
                FetchOutcome::NotFound => {
                    warn!(?parent_hash, "reorg ancestor not yet available from rpc, deferring");
                    return Ok(false);
                }
                FetchOutcome::Cancelled => return Ok(false),
            };
            ancestors.push(parent);
        }

        if popped > 0 {
            #[allow(clippy::cast_precision_loss)]
            REORG_DEPTH.observe(popped as f64);
        }

        for ancestor in ancestors.into_iter().rev() {
            self.chain.lock().unwrap().push(ancestor.clone())?;
            BLOCKS_ADDED.inc();
            events.push(ancestor);
        }
        Ok(true)
    }

    /// Step (iv): attaches logs to every `Added` event still missing them.
    /// Failures are non-fatal by design (spec §4.3/§7): the block is left
    /// `ok = false` and picked up again by the next backfill pass.
    async fn attach_logs(&self, events: &mut [Block], cancel: &CancellationToken) {
        let topics = self.log_topic_filter();
        for event in events.iter_mut() {
            if event.is_removed() {
                event.ok = true;
                continue;
            }
            if cancel.is_cancelled() {
                continue;
            }
            match fetch_logs_once(&*self.rpc, event.hash(), topics.clone(), self.options.timeout).await {
                Some(logs) => {
                    event.logs = Some(logs);
                    event.ok = true;
                }
                None => {
                    LOG_FETCH_FAILURES.inc();
                }
            }
        }
    }

    /// Updates per-block consecutive-failure counts after a backfill pass:
    /// clears entries that recovered or fell out of retention, bumps the
    /// rest, and reports `MonitorError::LogsBackfillFailed` once a block
    /// crosses `BACKFILL_FAILURE_THRESHOLD` (logged only, not returned —
    /// a persistently failing log fetch never aborts the monitor loop).
    fn track_backfill_attempts(&self, recovered: &[H256], still_failing: &[H256]) {
        let retained: std::collections::HashSet<H256> =
            self.chain.lock().unwrap().blocks().iter().map(Block::hash).collect();

        let mut attempts = self.backfill_attempts.lock().unwrap();
        for hash in recovered {
            attempts.remove(hash);
        }
        attempts.retain(|hash, _| retained.contains(hash));
        for hash in still_failing {
            let count = attempts.entry(*hash).or_insert(0);
            *count += 1;
            if *count == BACKFILL_FAILURE_THRESHOLD {
                error!(
                    error = %MonitorError::LogsBackfillFailed(*hash),
                    ?hash,
                    attempts = *count,
                    "log backfill failing persistently for block"
                );
            }
        }
    }

    fn log_topic_filter(&self) -> Vec<Vec<H256>> {
        if self.options.log_topics.is_empty() {
            Vec::new()
        } else {
            vec![self.options.log_topics.clone()]
        }
    }

    async fn fetch_latest_block_number(&self, cancel: &CancellationToken) -> Result<Option<u64>, MonitorError> {
        match self.call_with_retry(cancel, || self.rpc.block_number()).await? {
            Fetch::Ready(n) => Ok(Some(n)),
            Fetch::Cancelled => Ok(None),
        }
    }

    async fn fetch_by_number(&self, number: u64, cancel: &CancellationToken) -> Result<FetchOutcome<Block>, MonitorError> {
        let timer = BLOCK_HEADER_LATENCY.start_timer();
        let raw = match self.call_with_retry(cancel, || self.rpc.block_by_number(number)).await? {
            Fetch::Cancelled => return Ok(FetchOutcome::Cancelled),
            Fetch::Ready(raw) => raw,
        };
        timer.observe_duration();
        Ok(Self::raw_to_outcome(raw))
    }

    async fn fetch_by_hash(&self, hash: H256, cancel: &CancellationToken) -> Result<FetchOutcome<Block>, MonitorError> {
        let timer = BLOCK_HEADER_LATENCY.start_timer();
        let raw = match self.call_with_retry(cancel, || self.rpc.block_by_hash(hash)).await? {
            Fetch::Cancelled => return Ok(FetchOutcome::Cancelled),
            Fetch::Ready(raw) => raw,
        };
        timer.observe_duration();
        Ok(Self::raw_to_outcome(raw))
    }

    fn raw_to_outcome(raw: Option<web3::types::Block<Transaction>>) -> FetchOutcome<Block> {
        match raw {
            None => FetchOutcome::NotFound,
            Some(raw) => match Header::try_from_web3(&raw) {
                Ok(header) => FetchOutcome::Found(Block::new_added(header, raw.transactions)),
                Err(err) => {
                    warn!(?err, "rpc returned an incomplete block, treating as not found");
                    FetchOutcome::NotFound
                }
            },
        }
    }

    /// Calls `f`, retrying `Transport`/`Timeout` errors up to `MAX_TRIES`
    /// times with a linear backoff before surfacing the error (spec §7:
    /// "Timeout treated as Transport"). Cancellation observed during both
    /// the call itself and the backoff sleep.
    async fn call_with_retry<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<Fetch<T>, MonitorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 0usize;
        loop {
            let call = tokio::time::timeout(self.options.timeout, f());
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Fetch::Cancelled),
                result = call => result,
            };
            let err = match outcome {
                Ok(Ok(value)) => return Ok(Fetch::Ready(value)),
                Ok(Err(err)) => err,
                Err(_elapsed) => RpcError::Timeout,
            };

            attempt += 1;
            if attempt >= MAX_TRIES {
                error!(?err, attempt, "rpc call exhausted its retry budget");
                return Err(MonitorError::Rpc(err));
            }
            warn!(?err, attempt, "rpc call failed, retrying");
            if self.sleep_backoff_or_cancel(cancel).await {
                return Ok(Fetch::Cancelled);
            }
        }
    }

    /// Sleeps for `polling_interval`, returning `true` if cancellation
    /// fired first.
    async fn sleep_or_cancel(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => true,
            () = sleep(self.options.polling_interval) => false,
        }
    }

    async fn sleep_backoff_or_cancel(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => true,
            () = sleep(RETRY_DELAY) => false,
        }
    }
}

/// A single, non-retried log fetch used by both `attach_logs` and the
/// backfiller: failures here are recoverable (leave `ok = false`), unlike
/// `call_with_retry`'s bounded-then-fatal policy for block fetches.
async fn fetch_logs_once(
    rpc: &dyn RpcSource,
    block_hash: H256,
    topics: Vec<Vec<H256>>,
    timeout: Duration,
) -> Option<Vec<Log>> {
    match tokio::time::timeout(timeout, rpc.filter_logs(block_hash, topics)).await {
        Ok(Ok(logs)) => Some(logs),
        Ok(Err(err)) => {
            warn!(?err, ?block_hash, "log fetch failed");
            None
        }
        Err(_elapsed) => {
            warn!(?block_hash, "log fetch timed out");
            None
        }
    }
}
