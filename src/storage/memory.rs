use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::Value;

use super::{cas_input, ExecutionInputStore, NodeExecutionStore};
use crate::core::errors::{EngineError, Result};
use crate::model::{ExecutionInputInstance, InputState, NodeExecution, NodeUpdate, Status};

/// In-memory store. CAS runs under the DashMap shard lock of the record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: DashMap<String, NodeExecution>,
    children_by_parent: DashMap<String, DashSet<String>>,
    inputs: DashMap<String, ExecutionInputInstance>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[async_trait]
impl NodeExecutionStore for MemoryStore {
    async fn save(&self, execution: &NodeExecution) -> Result<()> {
        match self.executions.entry(execution.id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::NodeExecutionExists {
                    node_execution_id: execution.id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
            }
        }
        if let Some(parent_id) = &execution.parent_id {
            self.children_by_parent
                .entry(parent_id.clone())
                .or_default()
                .insert(execution.id.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn update_status_with_ops(
        &self,
        id: &str,
        allowed_from: &[Status],
        to: Status,
        ops: Vec<NodeUpdate>,
    ) -> Result<Option<NodeExecution>> {
        let mut entry = self
            .executions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        if entry.try_transition(allowed_from, to, ops) {
            Ok(Some(entry.clone()))
        } else {
            Ok(None)
        }
    }

    async fn apply(&self, id: &str, ops: Vec<NodeUpdate>) -> Result<NodeExecution> {
        let mut entry = self
            .executions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        entry.apply_updates(ops)?;
        Ok(entry.clone())
    }

    async fn take_timeout_instance_ids(&self, id: &str) -> Result<Vec<String>> {
        let mut entry = self
            .executions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        Ok(std::mem::take(&mut entry.timeout_instance_ids))
    }

    async fn fetch_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        let Some(ids) = self.children_by_parent.get(parent_id) else {
            return Ok(Vec::new());
        };
        let child_ids: Vec<String> = ids.iter().map(|id| id.key().clone()).collect();
        drop(ids);

        let mut children: Vec<NodeExecution> = child_ids
            .iter()
            .filter_map(|id| self.executions.get(id).map(|e| e.value().clone()))
            .filter(|child| !child.old_retry)
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn fetch_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>> {
        Ok(self
            .executions
            .iter()
            .filter(|e| statuses.contains(&e.status))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.ambiance.plan_execution_id == plan_execution_id)
            .map(|e| e.value().clone())
            .collect())
    }
}

#[async_trait]
impl ExecutionInputStore for MemoryStore {
    async fn save_input(&self, instance: &ExecutionInputInstance) -> Result<()> {
        self.inputs
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn get_input(&self, instance_id: &str) -> Result<Option<ExecutionInputInstance>> {
        Ok(self.inputs.get(instance_id).map(|i| i.value().clone()))
    }

    async fn transition_input(
        &self,
        instance_id: &str,
        from: InputState,
        to: InputState,
        merged_input: Option<Value>,
    ) -> Result<Option<ExecutionInputInstance>> {
        let mut entry =
            self.inputs
                .get_mut(instance_id)
                .ok_or_else(|| EngineError::InputInstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        if cas_input(&mut entry, from, to, merged_input) {
            Ok(Some(entry.clone()))
        } else {
            Ok(None)
        }
    }

    async fn fetch_inputs_by_state(&self, state: InputState) -> Result<Vec<ExecutionInputInstance>> {
        Ok(self
            .inputs
            .iter()
            .filter(|i| i.state == state)
            .map(|i| i.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ambiance, ExecutionMode, PlanNode, StepType};
    use serde_json::json;

    fn exec(id: &str, parent: Option<&str>) -> NodeExecution {
        let node = PlanNode::new(id, StepType::step("NOOP"), ExecutionMode::Sync);
        NodeExecution::queued(
            id,
            Ambiance::new("plan", "pe-1"),
            "plan",
            &node,
            parent.map(str::to_string),
            parent.map(|_| id.to_string()),
        )
    }

    #[tokio::test]
    async fn test_save_rejects_duplicates() {
        let store = MemoryStore::new();
        store.save(&exec("a", None)).await.unwrap();
        let err = store.save(&exec("a", None)).await.unwrap_err();
        assert!(matches!(err, EngineError::NodeExecutionExists { .. }));
    }

    #[tokio::test]
    async fn test_cas_is_single_winner() {
        let store = MemoryStore::new();
        store.save(&exec("a", None)).await.unwrap();

        let first = store
            .update_status("a", &[Status::Queued], Status::Running)
            .await
            .unwrap();
        let second = store
            .update_status("a", &[Status::Queued], Status::Running)
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_children_exclude_old_retries() {
        let store = MemoryStore::new();
        store.save(&exec("parent", None)).await.unwrap();
        store.save(&exec("c1", Some("parent"))).await.unwrap();
        store.save(&exec("c2", Some("parent"))).await.unwrap();
        store
            .apply("c1", vec![NodeUpdate::MarkOldRetry])
            .await
            .unwrap();

        let children = store.fetch_children("parent").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "c2");

        let queued = store
            .count_by_parent_and_status("parent", &[Status::Queued])
            .await
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn test_take_timeout_ids_once() {
        let store = MemoryStore::new();
        store.save(&exec("a", None)).await.unwrap();
        store
            .apply("a", vec![NodeUpdate::AddTimeoutInstances(vec!["t1".into()])])
            .await
            .unwrap();

        assert_eq!(store.take_timeout_instance_ids("a").await.unwrap(), vec!["t1"]);
        assert!(store.take_timeout_instance_ids("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_input_cas() {
        let store = MemoryStore::new();
        let instance = ExecutionInputInstance::new("in-1", "a", "pe-1", json!({}), 6);
        store.save_input(&instance).await.unwrap();

        let fulfilled = store
            .transition_input("in-1", InputState::Waiting, InputState::Fulfilled, Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(fulfilled.unwrap().merged_input, Some(json!({"x": 1})));

        let again = store
            .transition_input("in-1", InputState::Waiting, InputState::Fulfilled, None)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_non_final_statuses() {
        let store = MemoryStore::new();
        store.save(&exec("a", None)).await.unwrap();
        store.save(&exec("b", None)).await.unwrap();
        store.save(&exec("c", None)).await.unwrap();
        store
            .update_status("b", &[Status::Queued], Status::Running)
            .await
            .unwrap();
        store
            .update_status("c", &[Status::Queued], Status::Skipped)
            .await
            .unwrap();

        let mut statuses = store.fetch_non_final_statuses("pe-1").await.unwrap();
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(statuses, vec![Status::Queued, Status::Running]);
    }
}
