//! Notification broker
//!
//! Correlates wait keys to callbacks. A wait covers one or more keys and
//! fires exactly once: when every key has a response, when one of its keys
//! reports an error and all others have arrived, or when its timeout elapses.
//! Responses that arrive before their wait is registered are parked and
//! consumed at registration. Arrivals for keys whose wait already fired or
//! was cancelled are dropped. Both kinds of bookkeeping age out after
//! `RETENTION`.
//!
//! Callbacks are delivered on one consumer task per partition; a wait is
//! pinned to the partition chosen by hashing its id.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::core::errors::{EngineError, Result};
use crate::model::ResponseMap;

// How long parked arrivals and settled keys are remembered
const RETENTION: Duration = Duration::from_secs(10 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Receives the outcome of a registered wait
#[async_trait]
pub trait NotifyCallback: Send + Sync {
    async fn notify(&self, responses: ResponseMap);

    async fn notify_error(&self, responses: ResponseMap);

    async fn notify_timeout(&self, responses: ResponseMap);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryKind {
    Notify,
    Error,
    Timeout,
}

struct Delivery {
    wait_id: String,
    kind: DeliveryKind,
    responses: ResponseMap,
    callback: Arc<dyn NotifyCallback>,
}

#[derive(Clone)]
enum Arrival {
    Response(Bytes),
    Error(Bytes),
}

struct Wait {
    pending: HashSet<String>,
    responses: ResponseMap,
    errored: bool,
    callback: Arc<dyn NotifyCallback>,
    timer: Option<AbortHandle>,
}

struct CorrelationTable {
    waits: HashMap<String, Wait>,
    by_key: HashMap<String, String>,
    early: HashMap<String, (Instant, Arrival)>,
    settled: HashMap<String, Instant>,
    last_pruned: Instant,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self {
            waits: HashMap::new(),
            by_key: HashMap::new(),
            early: HashMap::new(),
            settled: HashMap::new(),
            last_pruned: Instant::now(),
        }
    }
}

impl CorrelationTable {
    /// Record an arrival for a registered key; returns the wait if it completed
    fn record(&mut self, key: &str, arrival: Arrival) -> Option<(String, Wait)> {
        let wait_id = self.by_key.get(key)?.clone();
        let wait = self.waits.get_mut(&wait_id)?;
        if !wait.pending.remove(key) {
            return None;
        }
        self.by_key.remove(key);
        self.settled.insert(key.to_string(), Instant::now());
        match arrival {
            Arrival::Response(bytes) => {
                wait.responses.insert(key.to_string(), bytes);
            }
            Arrival::Error(bytes) => {
                wait.errored = true;
                wait.responses.insert(key.to_string(), bytes);
            }
        }
        if wait.pending.is_empty() {
            self.waits.remove(&wait_id).map(|wait| (wait_id, wait))
        } else {
            None
        }
    }

    fn remove_wait(&mut self, wait_id: &str) -> Option<Wait> {
        let wait = self.waits.remove(wait_id)?;
        let now = Instant::now();
        for key in &wait.pending {
            self.by_key.remove(key);
            self.settled.insert(key.clone(), now);
        }
        Some(wait)
    }

    fn prune(&mut self, now: Instant) {
        if now.duration_since(self.last_pruned) < PRUNE_INTERVAL {
            return;
        }
        self.last_pruned = now;
        let before = self.early.len() + self.settled.len();
        self.early
            .retain(|_, (at, _)| now.duration_since(*at) < RETENTION);
        self.settled
            .retain(|_, at| now.duration_since(*at) < RETENTION);
        let pruned = before - self.early.len() - self.settled.len();
        if pruned > 0 {
            debug!(pruned, "Pruned stale broker keys");
        }
    }
}

struct BrokerInner {
    table: Mutex<CorrelationTable>,
    partitions: Vec<mpsc::UnboundedSender<Delivery>>,
}

impl BrokerInner {
    fn dispatch(&self, wait_id: String, wait: Wait, kind: DeliveryKind) -> Result<()> {
        if let Some(timer) = &wait.timer {
            timer.abort();
        }
        let mut hasher = DefaultHasher::new();
        wait_id.hash(&mut hasher);
        let partition = (hasher.finish() % self.partitions.len() as u64) as usize;
        trace!(wait_id = %wait_id, partition, ?kind, "Dispatching wait");
        self.partitions[partition]
            .send(Delivery {
                wait_id,
                kind,
                responses: wait.responses,
                callback: wait.callback,
            })
            .map_err(|e| EngineError::BrokerDelivery {
                correlation_key: e.0.wait_id,
                reason: "partition consumer stopped".into(),
            })
    }

    fn expire(&self, wait_id: &str) {
        let wait = self.table.lock().remove_wait(wait_id);
        if let Some(wait) = wait {
            debug!(wait_id = %wait_id, pending = wait.pending.len(), "Wait timed out");
            if let Err(e) = self.dispatch(wait_id.to_string(), wait, DeliveryKind::Timeout) {
                error!(wait_id = %wait_id, error = %e, "Failed to deliver wait timeout");
            }
        }
    }
}

/// Handle to the broker; clones share the same correlation table
#[derive(Clone)]
pub struct NotifyBroker {
    inner: Arc<BrokerInner>,
}

impl NotifyBroker {
    /// Create a broker with `partitions` consumer tasks. Must be called inside a tokio runtime.
    pub fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tokio::spawn(consume_partition(partition, rx));
        }
        Self {
            inner: Arc::new(BrokerInner {
                table: Mutex::new(CorrelationTable::default()),
                partitions: senders,
            }),
        }
    }

    /// Register a wait on `keys`; returns the wait id.
    ///
    /// With no keys the callback is notified immediately with an empty map.
    pub fn register_wait(
        &self,
        keys: Vec<String>,
        callback: Arc<dyn NotifyCallback>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let wait_id = uuid::Uuid::new_v4().to_string();
        let mut wait = Wait {
            pending: HashSet::new(),
            responses: ResponseMap::new(),
            errored: false,
            callback,
            timer: None,
        };

        let mut table = self.inner.table.lock();
        for key in &keys {
            if let Some(owner) = table.by_key.get(key) {
                return Err(EngineError::BrokerDelivery {
                    correlation_key: key.clone(),
                    reason: format!("key already bound to wait {}", owner),
                });
            }
        }
        for key in keys {
            table.settled.remove(&key);
            match table.early.remove(&key).map(|(_, arrival)| arrival) {
                Some(Arrival::Response(bytes)) => {
                    wait.responses.insert(key, bytes);
                }
                Some(Arrival::Error(bytes)) => {
                    wait.errored = true;
                    wait.responses.insert(key, bytes);
                }
                None => {
                    table.by_key.insert(key.clone(), wait_id.clone());
                    wait.pending.insert(key);
                }
            }
        }

        if wait.pending.is_empty() {
            drop(table);
            let kind = if wait.errored {
                DeliveryKind::Error
            } else {
                DeliveryKind::Notify
            };
            debug!(wait_id = %wait_id, "Wait satisfied at registration");
            self.inner.dispatch(wait_id.clone(), wait, kind)?;
            return Ok(wait_id);
        }

        if let Some(timeout) = timeout {
            let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
            let timer_wait_id = wait_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&timer_wait_id);
                }
            });
            wait.timer = Some(handle.abort_handle());
        }
        debug!(wait_id = %wait_id, pending = wait.pending.len(), "Registered wait");
        table.waits.insert(wait_id.clone(), wait);
        Ok(wait_id)
    }

    /// Deliver a response for `key`
    pub fn fulfilled(&self, key: &str, response: Bytes) -> Result<()> {
        self.arrive(key, Arrival::Response(response))
    }

    /// Deliver an error for `key`; the wait fires through `notify_error`
    pub fn errored(&self, key: &str, message: impl Into<String>) -> Result<()> {
        self.arrive(key, Arrival::Error(Bytes::from(message.into())))
    }

    /// Expire the wait bound to `key` now
    pub fn timed_out(&self, key: &str) {
        let wait_id = self.inner.table.lock().by_key.get(key).cloned();
        match wait_id {
            Some(wait_id) => self.inner.expire(&wait_id),
            None => debug!(correlation_key = %key, "Timeout for unknown key ignored"),
        }
    }

    /// Drop whichever waits are bound to `keys`; returns how many were removed
    pub fn cancel_keys(&self, keys: &[String]) -> usize {
        let mut table = self.inner.table.lock();
        let wait_ids: HashSet<String> = keys
            .iter()
            .filter_map(|key| table.by_key.get(key).cloned())
            .collect();
        let mut cancelled = 0;
        for wait_id in wait_ids {
            if let Some(wait) = table.remove_wait(&wait_id) {
                if let Some(timer) = wait.timer {
                    timer.abort();
                }
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drop a wait without notifying it
    pub fn cancel(&self, wait_id: &str) -> bool {
        let wait = self.inner.table.lock().remove_wait(wait_id);
        match wait {
            Some(wait) => {
                if let Some(timer) = wait.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn pending_waits(&self) -> usize {
        self.inner.table.lock().waits.len()
    }

    pub fn is_waiting_on(&self, key: &str) -> bool {
        self.inner.table.lock().by_key.contains_key(key)
    }

    /// Arrivals held for keys nobody has registered yet
    pub fn parked_responses(&self) -> usize {
        self.inner.table.lock().early.len()
    }

    fn arrive(&self, key: &str, arrival: Arrival) -> Result<()> {
        let mut table = self.inner.table.lock();
        let now = Instant::now();
        table.prune(now);
        if !table.by_key.contains_key(key) {
            if table.settled.contains_key(key) {
                debug!(correlation_key = %key, "Late response for settled key dropped");
            } else if table.early.contains_key(key) {
                warn!(correlation_key = %key, "Duplicate early response dropped");
            } else {
                trace!(correlation_key = %key, "Parking response for unregistered key");
                table.early.insert(key.to_string(), (now, arrival));
            }
            return Ok(());
        }
        let completed = table.record(key, arrival);
        drop(table);

        if let Some((wait_id, wait)) = completed {
            let kind = if wait.errored {
                DeliveryKind::Error
            } else {
                DeliveryKind::Notify
            };
            self.inner.dispatch(wait_id, wait, kind)?;
        }
        Ok(())
    }
}

async fn consume_partition(partition: usize, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        trace!(partition, wait_id = %delivery.wait_id, "Delivering callback");
        match delivery.kind {
            DeliveryKind::Notify => delivery.callback.notify(delivery.responses).await,
            DeliveryKind::Error => delivery.callback.notify_error(delivery.responses).await,
            DeliveryKind::Timeout => delivery.callback.notify_timeout(delivery.responses).await,
        }
    }
    debug!(partition, "Broker partition consumer stopped");
}
