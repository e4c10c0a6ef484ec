//! Stream subscriptions
//!
//! Each stream handler owns one unbounded queue of [`SubscriptionEvent`]s.
//! Its start routine ([`run_polling`] or [`run_broadcast`]) drains the queue
//! for the lifetime of the gateway, keeping one producer task per live
//! subscription in a [`SubscriptionRegistry`].

use super::error::{ApiError, ErrorCode, OperationResult};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Receives every update produced for one subscription
pub type UpdateSink = Arc<dyn Fn(OperationResult<Value>) + Send + Sync>;

pub type SubscriptionSender = mpsc::UnboundedSender<SubscriptionEvent>;
pub type SubscriptionQueue = mpsc::UnboundedReceiver<SubscriptionEvent>;

/// Queue item consumed by a stream start routine
pub enum SubscriptionEvent {
    Add {
        subscription_id: String,
        data: Value,
        send: UpdateSink,
    },
    Remove {
        subscription_id: String,
    },
}

impl std::fmt::Debug for SubscriptionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionEvent::Add {
                subscription_id,
                data,
                ..
            } => f
                .debug_struct("Add")
                .field("subscription_id", subscription_id)
                .field("data", data)
                .finish(),
            SubscriptionEvent::Remove { subscription_id } => f
                .debug_struct("Remove")
                .field("subscription_id", subscription_id)
                .finish(),
        }
    }
}

/// Live subscriptions of one stream handler.
///
/// Dropping the registry cancels every producer.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, CancellationToken>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscription_id`, cancelling any producer it replaces
    pub fn add(&mut self, subscription_id: String) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.entries.insert(subscription_id.clone(), token.clone()) {
            tracing::debug!(subscription_id = %subscription_id, "Replacing subscription");
            previous.cancel();
        }
        token
    }

    /// Deregister and cancel; unknown ids are ignored
    pub fn remove(&mut self, subscription_id: &str) -> bool {
        match self.entries.remove(subscription_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Deregister a producer that finished by itself.
    ///
    /// A cancelled `token` was already removed or replaced, so the current
    /// entry is left alone.
    pub fn retire(&mut self, subscription_id: &str, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        self.remove(subscription_id)
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.entries.contains_key(subscription_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        for token in self.entries.values() {
            token.cancel();
        }
    }
}

/// Push interval requested in `data.intervalMs`, clamped to the allowed range
pub fn poll_interval(data: &Value) -> Duration {
    let millis = data
        .get("intervalMs")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
        .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
    Duration::from_millis(millis)
}

/// Timer driven start routine.
///
/// Every subscription re-invokes `poll` with its own `data` once right away
/// and then at its interval, sending each result. A `Forbidden` or
/// `NotFound` result is sent and then ends the subscription.
pub async fn run_polling<F, Fut>(queue: SubscriptionQueue, poll: F)
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult<Value>> + Send + 'static,
{
    let poll = Arc::new(poll);
    drive(queue, "polling", move |_, data, send, token| {
        let poll = poll.clone();
        let period = poll_interval(&data);
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = poll(data.clone()) => result,
                };
                let last = ends_subscription(&result);
                send(result);
                if last {
                    break;
                }
            }
        }
    })
    .await
}

/// Event driven start routine.
///
/// Every subscription gets its own receiver from `subscribe` and is sent
/// each event from then on. Lagging receivers skip the missed events; a
/// closed source ends the subscription.
pub async fn run_broadcast<T, F>(queue: SubscriptionQueue, subscribe: F)
where
    T: Serialize + Clone + Send + 'static,
    F: Fn() -> broadcast::Receiver<T> + Send + Sync + 'static,
{
    drive(queue, "broadcast", move |subscription_id, _, send, token| {
        let mut events = BroadcastStream::new(subscribe());
        async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) => send(serde_json::to_value(event).map_err(|e| {
                        ApiError::internal(format!("Failed to encode event: {}", e))
                    })),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::warn!(
                            subscription_id = %subscription_id,
                            skipped,
                            "Event subscriber lagged"
                        );
                    }
                    None => break,
                }
            }
        }
    })
    .await
}

/// Errors that will not clear by polling again
fn ends_subscription(result: &OperationResult<Value>) -> bool {
    matches!(result, Err(err) if matches!(err.code, ErrorCode::Forbidden | ErrorCode::NotFound))
}

/// Drain `queue`, running one producer from `start` per subscription.
///
/// Producers that finish on their own are retired from the registry.
async fn drive<S, P>(mut queue: SubscriptionQueue, kind: &'static str, start: S)
where
    S: Fn(String, Value, UpdateSink, CancellationToken) -> P + Send + 'static,
    P: Future<Output = ()> + Send + 'static,
{
    let mut registry = SubscriptionRegistry::new();
    let (finished_tx, mut finished) = mpsc::unbounded_channel::<(String, CancellationToken)>();

    loop {
        let event = tokio::select! {
            event = queue.recv() => match event {
                Some(event) => event,
                None => break,
            },
            Some((subscription_id, token)) = finished.recv() => {
                if registry.retire(&subscription_id, &token) {
                    tracing::debug!(subscription_id = %subscription_id, kind, "Subscription ended");
                }
                continue;
            }
        };

        match event {
            SubscriptionEvent::Add {
                subscription_id,
                data,
                send,
            } => {
                let token = registry.add(subscription_id.clone());
                let producer = start(subscription_id.clone(), data, send, token.clone());
                let finished_tx = finished_tx.clone();
                tokio::spawn(async move {
                    producer.await;
                    let _ = finished_tx.send((subscription_id, token));
                });
            }
            SubscriptionEvent::Remove { subscription_id } => {
                registry.remove(&subscription_id);
            }
        }
    }
    tracing::debug!(kind, "Stream queue closed");
}
