//! External task executor seam
//!
//! The engine only dispatches; the executor must deliver exactly one
//! `TaskResult` (or error) per correlation id back through the broker.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::broker::NotifyBroker;
use crate::core::errors::{EngineError, Result};
use crate::model::{Ambiance, TaskProtocol, TaskResult};

/// One task handed to the executor
#[derive(Debug, Clone)]
pub struct TaskDispatch {
    pub correlation_id: String,
    pub node_execution_id: String,
    pub task_type: String,
    pub protocol: TaskProtocol,
    pub payload: Bytes,
    pub ambiance: Ambiance,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn dispatch(&self, task: TaskDispatch) -> Result<()>;
}

/// Executor used when none is configured; every dispatch fails
pub struct UnconfiguredTaskExecutor;

#[async_trait]
impl TaskExecutor for UnconfiguredTaskExecutor {
    async fn dispatch(&self, task: TaskDispatch) -> Result<()> {
        warn!(correlation_id = %task.correlation_id, task_type = %task.task_type, "No task executor configured");
        Err(EngineError::TaskDispatch {
            correlation_id: task.correlation_id,
            reason: "no task executor configured".into(),
        })
    }
}

/// Report a task's terminal result for `correlation_id`
pub fn report_task_result(
    broker: &NotifyBroker,
    correlation_id: &str,
    result: &TaskResult,
) -> Result<()> {
    broker.fulfilled(correlation_id, result.to_bytes()?)
}
