//! Per-node timeouts
//!
//! `TimeoutEngine` arms and deletes timeout instances. `TimeoutTracker` tears
//! down every instance of a node once it reaches a terminal status. Cleanup is
//! best effort: failures are logged and counted, never rolled back into the
//! node's status.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::core::errors::Result;
use crate::core::metrics::EngineMetrics;
use crate::model::{NodeExecution, Status};
use crate::storage::NodeExecutionStore;

/// Invoked when an armed timeout elapses
#[async_trait]
pub trait TimeoutCallback: Send + Sync {
    async fn on_timeout(&self, node_execution_id: String, timeout_instance_id: String);
}

#[async_trait]
pub trait TimeoutEngine: Send + Sync {
    /// Arm a timeout for a node; returns the timeout instance id
    async fn register(
        &self,
        node_execution_id: &str,
        after: Duration,
        callback: Arc<dyn TimeoutCallback>,
    ) -> Result<String>;

    /// Delete instances; unknown ids are ignored
    async fn delete(&self, instance_ids: &[String]) -> Result<()>;
}

/// Timeouts as sleeping tokio tasks
#[derive(Default)]
pub struct TokioTimeoutEngine {
    armed: Arc<DashMap<String, AbortHandle>>,
}

impl TokioTimeoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    pub fn is_armed(&self, instance_id: &str) -> bool {
        self.armed.contains_key(instance_id)
    }
}

#[async_trait]
impl TimeoutEngine for TokioTimeoutEngine {
    async fn register(
        &self,
        node_execution_id: &str,
        after: Duration,
        callback: Arc<dyn TimeoutCallback>,
    ) -> Result<String> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let armed = Arc::clone(&self.armed);
        let node_execution_id = node_execution_id.to_string();
        let fired_id = instance_id.clone();

        // Hold the map entry while spawning so a fast timer cannot remove it first
        let entry = self.armed.entry(instance_id.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if armed.remove(&fired_id).is_some() {
                debug!(node_execution_id = %node_execution_id, timeout_instance_id = %fired_id, "Timeout fired");
                callback.on_timeout(node_execution_id, fired_id).await;
            }
        });
        entry.insert(handle.abort_handle());
        Ok(instance_id)
    }

    async fn delete(&self, instance_ids: &[String]) -> Result<()> {
        for id in instance_ids {
            if let Some((_, handle)) = self.armed.remove(id) {
                handle.abort();
            }
        }
        Ok(())
    }
}

/// Removes timeout instances of nodes that reached a terminal status
pub struct TimeoutTracker {
    store: Arc<dyn NodeExecutionStore>,
    engine: Arc<dyn TimeoutEngine>,
    metrics: Arc<EngineMetrics>,
}

impl TimeoutTracker {
    pub fn new(
        store: Arc<dyn NodeExecutionStore>,
        engine: Arc<dyn TimeoutEngine>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            engine,
            metrics,
        }
    }

    /// Returns the number of instances deleted
    pub async fn on_terminal(&self, execution: &NodeExecution) -> usize {
        if !execution.status.is_terminal() {
            return 0;
        }
        // An expiry was caused by a timeout; tearing it down again would recurse
        if execution.status == Status::Expired {
            debug!(node_execution_id = %execution.id, "Skipping timeout cleanup for expired node");
            return 0;
        }

        let instance_ids = match self.store.take_timeout_instance_ids(&execution.id).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(node_execution_id = %execution.id, error = %e, "Failed to clear timeout instance ids");
                self.metrics.record_timeout_cleanup_failure();
                return 0;
            }
        };
        if instance_ids.is_empty() {
            return 0;
        }

        if let Err(e) = self.engine.delete(&instance_ids).await {
            error!(
                node_execution_id = %execution.id,
                timeout_instance_ids = ?instance_ids,
                error = %e,
                "Failed to delete timeout instances"
            );
            self.metrics.record_timeout_cleanup_failure();
            return 0;
        }
        debug!(node_execution_id = %execution.id, count = instance_ids.len(), "Deleted timeout instances");
        instance_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::EngineError;
    use crate::model::{Ambiance, ExecutionMode, NodeUpdate, PlanNode, StepType};
    use crate::storage::MemoryStore;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl TimeoutCallback for Forward {
        async fn on_timeout(&self, node_execution_id: String, _timeout_instance_id: String) {
            let _ = self.0.send(node_execution_id);
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl TimeoutEngine for FailingEngine {
        async fn register(
            &self,
            _node_execution_id: &str,
            _after: Duration,
            _callback: Arc<dyn TimeoutCallback>,
        ) -> Result<String> {
            Ok("t".into())
        }

        async fn delete(&self, _instance_ids: &[String]) -> Result<()> {
            Err(EngineError::TimeoutEngine("unavailable".into()))
        }
    }

    async fn terminal_node(store: &MemoryStore, status: Status) -> NodeExecution {
        let node = PlanNode::new("n", StepType::step("NOOP"), ExecutionMode::Async);
        let exec = NodeExecution::queued("e1", Ambiance::new("p", "pe"), "p", &node, None, None);
        store.save(&exec).await.unwrap();
        store
            .update_status_with_ops(
                "e1",
                &[Status::Queued],
                Status::Running,
                vec![NodeUpdate::AddTimeoutInstances(vec!["t1".into(), "t2".into()])],
            )
            .await
            .unwrap();
        store
            .update_status("e1", &[Status::Running], status)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let engine = TokioTimeoutEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = engine
            .register("e1", Duration::from_secs(1), Arc::new(Forward(tx)))
            .await
            .unwrap();
        assert!(engine.is_armed(&id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("e1"));
        assert_eq!(engine.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_timeout_never_fires() {
        let engine = TokioTimeoutEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = engine
            .register("e1", Duration::from_secs(1), Arc::new(Forward(tx)))
            .await
            .unwrap();
        engine.delete(&[id.clone(), "unknown".into()]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let tracker = TimeoutTracker::new(
            store.clone(),
            Arc::new(TokioTimeoutEngine::new()),
            metrics.clone(),
        );
        let exec = terminal_node(&store, Status::Succeeded).await;

        assert_eq!(tracker.on_terminal(&exec).await, 2);
        assert_eq!(tracker.on_terminal(&exec).await, 0);
        assert!(store.get_required("e1").await.unwrap().timeout_instance_ids.is_empty());
        assert_eq!(metrics.snapshot().timeout_cleanup_failures, 0);
    }

    #[tokio::test]
    async fn test_expired_node_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let tracker = TimeoutTracker::new(
            store.clone(),
            Arc::new(TokioTimeoutEngine::new()),
            Arc::new(EngineMetrics::new()),
        );
        let exec = terminal_node(&store, Status::Expired).await;

        assert_eq!(tracker.on_terminal(&exec).await, 0);
        assert_eq!(store.get_required("e1").await.unwrap().timeout_instance_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_is_counted_not_raised() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let tracker = TimeoutTracker::new(store.clone(), Arc::new(FailingEngine), metrics.clone());
        let exec = terminal_node(&store, Status::Failed).await;

        assert_eq!(tracker.on_terminal(&exec).await, 0);
        assert_eq!(metrics.snapshot().timeout_cleanup_failures, 1);
        assert_eq!(store.get_required("e1").await.unwrap().status, Status::Failed);
    }
}
