//! Storage layer for the engine
//!
//! The node execution store is the single source of truth for every run:
//! status, continuation state and timeout registrations all live here and
//! are changed through compare-and-set updates. Two backends are provided,
//! an in-memory store for tests and embedding, and a sled-backed store that
//! survives restarts.

pub mod memory;
pub mod sled_storage;

pub use memory::MemoryStore;
pub use sled_storage::SledStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::core::errors::{EngineError, Result};
use crate::model::{ExecutionInputInstance, InputState, NodeExecution, NodeUpdate, Status};

/// Persistence for node executions
#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Insert a new execution; fails if the id is taken
    async fn save(&self, execution: &NodeExecution) -> Result<()>;

    /// Get an execution by id
    async fn get(&self, id: &str) -> Result<Option<NodeExecution>>;

    /// Compare-and-set on status together with field updates.
    ///
    /// Returns the updated record, or `None` when the current status is not in
    /// `allowed_from` (or the move is illegal). Nothing is written in that case.
    async fn update_status_with_ops(
        &self,
        id: &str,
        allowed_from: &[Status],
        to: Status,
        ops: Vec<NodeUpdate>,
    ) -> Result<Option<NodeExecution>>;

    /// Field updates without a status change; terminal records only take bookkeeping
    async fn apply(&self, id: &str, ops: Vec<NodeUpdate>) -> Result<NodeExecution>;

    /// Atomically read and clear the timeout instance ids of a node
    async fn take_timeout_instance_ids(&self, id: &str) -> Result<Vec<String>>;

    /// Direct children of `parent_id`, old retries excluded
    async fn fetch_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;

    /// Every execution currently in one of `statuses`
    async fn fetch_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>>;

    /// Every execution of one plan execution
    async fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;

    async fn get_required(&self, id: &str) -> Result<NodeExecution> {
        self.get(id).await?.ok_or_else(|| EngineError::not_found(id))
    }

    async fn update_status(
        &self,
        id: &str,
        allowed_from: &[Status],
        to: Status,
    ) -> Result<Option<NodeExecution>> {
        self.update_status_with_ops(id, allowed_from, to, Vec::new())
            .await
    }

    async fn count_by_parent_and_status(&self, parent_id: &str, statuses: &[Status]) -> Result<usize> {
        Ok(self
            .fetch_children(parent_id)
            .await?
            .iter()
            .filter(|child| statuses.contains(&child.status))
            .count())
    }

    /// Distinct non-final statuses present in a plan execution
    async fn fetch_non_final_statuses(&self, plan_execution_id: &str) -> Result<Vec<Status>> {
        let present: BTreeSet<&'static str> = self
            .fetch_by_plan_execution(plan_execution_id)
            .await?
            .iter()
            .filter(|exec| !exec.status.is_terminal())
            .map(|exec| exec.status.as_str())
            .collect();
        present
            .into_iter()
            .map(|s| Status::from_str(s).map_err(EngineError::internal))
            .collect()
    }
}

/// Persistence for execution input instances
#[async_trait]
pub trait ExecutionInputStore: Send + Sync {
    async fn save_input(&self, instance: &ExecutionInputInstance) -> Result<()>;

    async fn get_input(&self, instance_id: &str) -> Result<Option<ExecutionInputInstance>>;

    /// Compare-and-set on the instance state, recording `merged_input` if given.
    /// `None` when the instance was not in `from`.
    async fn transition_input(
        &self,
        instance_id: &str,
        from: InputState,
        to: InputState,
        merged_input: Option<Value>,
    ) -> Result<Option<ExecutionInputInstance>>;

    async fn fetch_inputs_by_state(&self, state: InputState) -> Result<Vec<ExecutionInputInstance>>;

    async fn fetch_waiting_inputs_for_node(
        &self,
        node_execution_id: &str,
    ) -> Result<Vec<ExecutionInputInstance>> {
        Ok(self
            .fetch_inputs_by_state(InputState::Waiting)
            .await?
            .into_iter()
            .filter(|i| i.node_execution_id == node_execution_id)
            .collect())
    }
}

/// Input CAS shared by both backends
pub(crate) fn cas_input(
    instance: &mut ExecutionInputInstance,
    from: InputState,
    to: InputState,
    merged_input: Option<Value>,
) -> bool {
    if instance.state != from {
        return false;
    }
    instance.state = to;
    if merged_input.is_some() {
        instance.merged_input = merged_input;
    }
    true
}
