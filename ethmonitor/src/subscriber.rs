//! Subscriber registry and per-subscriber fan-out (spec component C4).
//!
//! Each subscriber gets a forwarder task that drains a bounded,
//! capacity-1 inbound channel — the thing `broadcast` sends into — into
//! an unbounded outbound channel the subscriber actually reads from.
//! This turns the monitor loop's potentially-blocking send into a
//! non-blocking one while preserving per-subscriber ordering, and gives
//! the forwarder task a deterministic exit: once the registry drops the
//! inbound sender (on `unsubscribe` or shutdown), `recv()` returns `None`,
//! the loop ends, the outbound sender drops, and the subscriber's stream
//! closes. No task outlives the monitor (see spec.md §9 "Goroutine leak
//! on shutdown").

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use ethkit_types::Block;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::statistics::{SUBSCRIBERS, SUBSCRIBER_BUFFER_DEPTH, SUBSCRIBER_STALLS};

/// Inbound channel capacity: one slot is enough — the forwarder drains it
/// immediately into the unbounded outbound side, so it is never meant to
/// buffer more than a single in-flight batch.
const INBOUND_CAPACITY: usize = 1;

/// How long a strict-mode send may stall before a warning is logged and
/// the send retried (spec.md §4.4 / §5).
const STRICT_STALL_WARNING: Duration = Duration::from_secs(4);

type Batch = Arc<Vec<Block>>;

struct SubscriberHandle {
    inbound: mpsc::Sender<Batch>,
    done: CancellationToken,
    forwarder: tokio::task::JoinHandle<()>,
}

/// A live subscription returned by [`SubscriberRegistry::subscribe`].
/// Implements `Stream` via [`tokio_stream`] so it can be combined with
/// other streams the way `block-watcher`'s consumer composes
/// `BroadcastStream`.
pub struct Subscription {
    id: u64,
    outbound: mpsc::UnboundedReceiver<Batch>,
    depth: Arc<AtomicUsize>,
    depth_gauge: prometheus::Gauge,
    done: CancellationToken,
    registry: Arc<Inner>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Receives the next batch of block events, or `None` once the
    /// monitor shuts down or `unsubscribe` is called.
    pub async fn recv(&mut self) -> Option<Vec<Block>> {
        let batch = self.outbound.recv().await?;
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        self.depth_gauge.set(depth as f64);
        Some(Arc::try_unwrap(batch).unwrap_or_else(|arc| (*arc).clone()))
    }

    /// Idempotent: a second call (or a call after the monitor already
    /// shut down) is a harmless no-op. Awaits the registry removal
    /// directly, so once this returns no further batch is delivered to
    /// this subscriber (spec §4.4) — no race with a concurrent
    /// `broadcast()` reading a stale registry entry.
    pub async fn unsubscribe(&self) {
        self.registry.unsubscribe(self.id).await;
    }

    /// Signals closure without going through the registry lock; observed
    /// by consumers that only want to know "are we done", not drain
    /// further data.
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Drop can't await the removal; callers that need the immediate
        // no-further-delivery postcondition should call `unsubscribe()`
        // explicitly instead of relying on the handle going out of scope.
        let inner = Arc::clone(&self.registry);
        let id = self.id;
        tokio::spawn(async move {
            inner.unsubscribe(id).await;
        });
    }
}

impl tokio_stream::Stream for Subscription {
    type Item = Vec<Block>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.outbound.poll_recv(cx) {
            Poll::Ready(Some(batch)) => {
                let depth = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
                self.depth_gauge.set(depth as f64);
                Poll::Ready(Some(Arc::try_unwrap(batch).unwrap_or_else(|arc| (*arc).clone())))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Inner {
    subscribers: RwLock<HashMap<u64, SubscriberHandle>>,
    next_id: AtomicU64,
    strict: bool,
    buffer_limit_warning: usize,
}

/// Registry of active subscribers plus the broadcast policy (spec.md
/// §4.4): strict mode blocks (with warning+retry) until every subscriber
/// has room; non-strict mode drops a batch for any subscriber that isn't
/// ready rather than stalling the monitor loop.
pub struct SubscriberRegistry {
    inner: Arc<Inner>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new(strict: bool, buffer_limit_warning: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                strict,
                buffer_limit_warning,
            }),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Batch>(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Batch>();
        let done = CancellationToken::new();
        let depth = Arc::new(AtomicUsize::new(0));
        let warning_threshold = self.inner.buffer_limit_warning;

        let forwarder_depth = Arc::clone(&depth);
        let gauge = SUBSCRIBER_BUFFER_DEPTH.with_label_values(&[&id.to_string()]);
        let forwarder_gauge = gauge.clone();
        let forwarder = tokio::spawn(async move {
            let mut warned = false;
            while let Some(batch) = inbound_rx.recv().await {
                let depth = forwarder_depth.fetch_add(1, Ordering::Relaxed) + 1;
                forwarder_gauge.set(depth as f64);
                if !warned && depth >= warning_threshold {
                    warned = true;
                    warn!(subscriber = id, depth, "subscriber buffer crossed warning threshold, still unbounded");
                }
                if outbound_tx.send(batch).is_err() {
                    break;
                }
            }
        });

        let handle = SubscriberHandle {
            inbound: inbound_tx,
            done: done.clone(),
            forwarder,
        };
        self.inner.subscribers.write().await.insert(id, handle);
        SUBSCRIBERS.set(self.inner.subscribers.read().await.len() as i64);

        Subscription {
            id,
            outbound: outbound_rx,
            depth,
            depth_gauge: gauge,
            done,
            registry: Arc::clone(&self.inner),
        }
    }

    pub async fn num_subscribers(&self) -> usize {
        self.inner.subscribers.read().await.len()
    }

    /// Delivers one batch of events to every active subscriber, honoring
    /// strict/non-strict policy per subscriber. The registry's read lock
    /// is dropped before any send is attempted — sends can suspend, and a
    /// lock must never be held across an `.await`.
    pub async fn broadcast(&self, events: Vec<Block>) {
        let batch: Batch = Arc::new(events);
        let senders: Vec<(u64, mpsc::Sender<Batch>)> = self
            .inner
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.inbound.clone()))
            .collect();

        for (id, inbound) in senders {
            if self.inner.strict {
                Self::send_strict(id, &inbound, &batch).await;
            } else {
                Self::send_lossy(id, &inbound, &batch);
            }
        }
    }

    async fn send_strict(id: u64, inbound: &mpsc::Sender<Batch>, batch: &Batch) {
        loop {
            match tokio::time::timeout(STRICT_STALL_WARNING, inbound.send(Arc::clone(batch))).await
            {
                Ok(Ok(())) => return,
                Ok(Err(_)) => return, // subscriber gone; nothing more to do
                Err(_elapsed) => {
                    SUBSCRIBER_STALLS.inc();
                    warn!(subscriber = id, "strict subscriber falling behind, retrying send");
                }
            }
        }
    }

    fn send_lossy(id: u64, inbound: &mpsc::Sender<Batch>, batch: &Batch) {
        if let Err(mpsc::error::TrySendError::Full(_)) = inbound.try_send(Arc::clone(batch)) {
            warn!(subscriber = id, "non-strict subscriber not ready, dropping batch");
        }
    }

    /// Deterministic shutdown: unsubscribes everyone and waits for every
    /// forwarder task to actually finish, so `run()` never returns while
    /// a forwarder is still alive.
    pub async fn shutdown(&self) {
        let handles: Vec<SubscriberHandle> = {
            let mut subscribers = self.inner.subscribers.write().await;
            subscribers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.done.cancel();
            drop(handle.inbound);
            let _ = handle.forwarder.await;
        }
        SUBSCRIBERS.set(0);
    }
}

impl Inner {
    async fn unsubscribe(&self, id: u64) {
        let removed = self.subscribers.write().await.remove(&id);
        if let Some(handle) = removed {
            handle.done.cancel();
            drop(handle.inbound);
            let _ = handle.forwarder.await;
            SUBSCRIBERS.set(self.subscribers.read().await.len() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use ethkit_types::Header;
    use web3::types::{H256, U256};

    use super::*;

    fn block(number: u64) -> Block {
        Block::new_added(
            Header {
                number,
                hash: H256::repeat_byte(number as u8),
                parent_hash: H256::zero(),
                timestamp: 0,
                base_fee: None,
                gas_used: U256::zero(),
                gas_limit: U256::zero(),
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn subscriber_receives_batches_in_order() {
        let registry = SubscriberRegistry::new(true, 4096);
        let mut sub = registry.subscribe().await;
        registry.broadcast(vec![block(1)]).await;
        registry.broadcast(vec![block(2)]).await;

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first[0].number(), 1);
        assert_eq!(second[0].number(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_closes_the_stream() {
        let registry = SubscriberRegistry::new(true, 4096);
        let mut sub = registry.subscribe().await;
        // Both calls are awaited directly, so the registry entry is gone
        // and the stream is closed the instant each call returns — no
        // reliance on executor scheduling to observe the postcondition.
        sub.unsubscribe().await;
        sub.unsubscribe().await;
        assert_eq!(registry.num_subscribers().await, 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_blocks_a_broadcast_already_in_flight_from_reaching_it() {
        let registry = SubscriberRegistry::new(true, 4096);
        let mut sub = registry.subscribe().await;
        registry.broadcast(vec![block(1)]).await;
        sub.unsubscribe().await;
        registry.broadcast(vec![block(2)]).await;

        // Only the batch sent before unsubscribe is observed.
        assert_eq!(sub.recv().await.unwrap()[0].number(), 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn non_strict_subscriber_drops_batches_when_not_ready() {
        let registry = SubscriberRegistry::new(false, 4096);
        let _sub = registry.subscribe().await;
        // No consumer ever reads; with a 1-slot inbound channel the
        // first send succeeds (the forwarder drains it instantly) but
        // this still must not block the broadcaster either way.
        registry.broadcast(vec![block(1)]).await;
        registry.broadcast(vec![block(2)]).await;
    }

    #[tokio::test]
    async fn shutdown_leaves_no_forwarder_tasks_running() {
        let registry = SubscriberRegistry::new(true, 4096);
        let sub = registry.subscribe().await;
        registry.shutdown().await;
        assert_eq!(registry.num_subscribers().await, 0);
        drop(sub);
    }
}
