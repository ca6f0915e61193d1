//! Sled-backed store
//!
//! Layout:
//! - `node_executions`: id -> zstd(json(NodeExecution))
//! - `executions_by_parent`: `{parent_id}/{child_id}` -> ()
//! - `executions_by_status`: `{STATUS}/{id}` -> ()
//! - `execution_inputs`: instance id -> zstd(json(ExecutionInputInstance))

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::{cas_input, ExecutionInputStore, NodeExecutionStore};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::model::{ExecutionInputInstance, InputState, NodeExecution, NodeUpdate, Status};

const EXECUTIONS_TREE: &str = "node_executions";
const PARENT_INDEX_TREE: &str = "executions_by_parent";
const STATUS_INDEX_TREE: &str = "executions_by_status";
const INPUTS_TREE: &str = "execution_inputs";
const INDEX_MARKER: &[u8] = &[];

pub struct SledStore {
    db: Db,
    executions: Tree,
    parent_index: Tree,
    status_index: Tree,
    inputs: Tree,
    compression_level: i32,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened sled node execution store");
        Self::from_db(db, 3)
    }

    /// Open using `db_path`, cache capacity and compression level from config
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let path = config.db_path.as_ref().ok_or_else(|| {
            EngineError::InvalidConfiguration("db_path is required for the sled store".into())
        })?;
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(config.db_cache_capacity)
            .open()?;
        info!(path = %path.display(), "Opened sled node execution store");
        Self::from_db(db, config.compression_level)
    }

    /// Throwaway store removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, 3)
    }

    fn from_db(db: Db, compression_level: i32) -> Result<Self> {
        Ok(Self {
            executions: db.open_tree(EXECUTIONS_TREE)?,
            parent_index: db.open_tree(PARENT_INDEX_TREE)?,
            status_index: db.open_tree(STATUS_INDEX_TREE)?,
            inputs: db.open_tree(INPUTS_TREE)?,
            db,
            compression_level,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(value)?;
        Ok(zstd::encode_all(&serialized[..], self.compression_level)?)
    }

    fn load_many(&self, ids: impl Iterator<Item = String>) -> Result<Vec<NodeExecution>> {
        let mut found = Vec::new();
        for id in ids {
            if let Some(raw) = self.executions.get(id.as_bytes())? {
                found.push(decode(&raw)?);
            }
        }
        Ok(found)
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    let bytes = zstd::decode_all(raw)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn abort<T>(err: EngineError) -> ConflictableTransactionResult<T, EngineError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn status_key(status: Status, id: &str) -> String {
    format!("{}/{}", status.as_str(), id)
}

fn parent_key(parent_id: &str, id: &str) -> String {
    format!("{}/{}", parent_id, id)
}

/// Trailing id of an index key
fn id_from_index_key(key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.split_once('/').map(|(_, id)| id.to_string())
}

#[async_trait]
impl NodeExecutionStore for SledStore {
    async fn save(&self, execution: &NodeExecution) -> Result<()> {
        let encoded = self.encode(execution)?;
        let id = execution.id.as_str();
        (&self.executions, &self.parent_index, &self.status_index).transaction(
            |(executions, parents, statuses)| -> ConflictableTransactionResult<(), EngineError> {
                if executions.get(id.as_bytes())?.is_some() {
                    return abort(EngineError::NodeExecutionExists {
                        node_execution_id: id.to_string(),
                    });
                }
                executions.insert(id.as_bytes(), encoded.as_slice())?;
                statuses.insert(status_key(execution.status, id).as_bytes(), INDEX_MARKER)?;
                if let Some(parent_id) = &execution.parent_id {
                    parents.insert(parent_key(parent_id, id).as_bytes(), INDEX_MARKER)?;
                }
                Ok(())
            },
        )?;
        debug!(node_execution_id = %id, status = %execution.status, "Saved node execution");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>> {
        match self.executions.get(id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update_status_with_ops(
        &self,
        id: &str,
        allowed_from: &[Status],
        to: Status,
        ops: Vec<NodeUpdate>,
    ) -> Result<Option<NodeExecution>> {
        let updated = (&self.executions, &self.status_index).transaction(
            |(executions, statuses)| -> ConflictableTransactionResult<Option<NodeExecution>, EngineError> {
                let Some(raw) = executions.get(id.as_bytes())? else {
                    return abort(EngineError::not_found(id));
                };
                let mut execution: NodeExecution =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                let from = execution.status;
                if !execution.try_transition(allowed_from, to, ops.clone()) {
                    return Ok(None);
                }
                let encoded = self
                    .encode(&execution)
                    .map_err(ConflictableTransactionError::Abort)?;
                executions.insert(id.as_bytes(), encoded)?;
                statuses.remove(status_key(from, id).as_bytes())?;
                statuses.insert(status_key(to, id).as_bytes(), INDEX_MARKER)?;
                Ok(Some(execution))
            },
        )?;
        Ok(updated)
    }

    async fn apply(&self, id: &str, ops: Vec<NodeUpdate>) -> Result<NodeExecution> {
        let updated = self.executions.transaction(
            |executions| -> ConflictableTransactionResult<NodeExecution, EngineError> {
                let Some(raw) = executions.get(id.as_bytes())? else {
                    return abort(EngineError::not_found(id));
                };
                let mut execution: NodeExecution =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                execution
                    .apply_updates(ops.clone())
                    .map_err(ConflictableTransactionError::Abort)?;
                let encoded = self
                    .encode(&execution)
                    .map_err(ConflictableTransactionError::Abort)?;
                executions.insert(id.as_bytes(), encoded)?;
                Ok(execution)
            },
        )?;
        Ok(updated)
    }

    async fn take_timeout_instance_ids(&self, id: &str) -> Result<Vec<String>> {
        let taken = self.executions.transaction(
            |executions| -> ConflictableTransactionResult<Vec<String>, EngineError> {
                let Some(raw) = executions.get(id.as_bytes())? else {
                    return abort(EngineError::not_found(id));
                };
                let mut execution: NodeExecution =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                let taken = std::mem::take(&mut execution.timeout_instance_ids);
                if !taken.is_empty() {
                    let encoded = self
                        .encode(&execution)
                        .map_err(ConflictableTransactionError::Abort)?;
                    executions.insert(id.as_bytes(), encoded)?;
                }
                Ok(taken)
            },
        )?;
        Ok(taken)
    }

    async fn fetch_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        let prefix = format!("{}/", parent_id);
        let mut ids = Vec::new();
        for entry in self.parent_index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            if let Some(id) = id_from_index_key(&key) {
                ids.push(id);
            }
        }
        let mut children: Vec<NodeExecution> = self
            .load_many(ids.into_iter())?
            .into_iter()
            .filter(|child| !child.old_retry)
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn fetch_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>> {
        let mut ids = Vec::new();
        for status in statuses {
            let prefix = format!("{}/", status.as_str());
            for entry in self.status_index.scan_prefix(prefix.as_bytes()) {
                let (key, _) = entry?;
                if let Some(id) = id_from_index_key(&key) {
                    ids.push(id);
                }
            }
        }
        self.load_many(ids.into_iter())
    }

    async fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let mut found = Vec::new();
        for entry in self.executions.iter() {
            let (_, raw) = entry?;
            let execution: NodeExecution = decode(&raw)?;
            if execution.ambiance.plan_execution_id == plan_execution_id {
                found.push(execution);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl ExecutionInputStore for SledStore {
    async fn save_input(&self, instance: &ExecutionInputInstance) -> Result<()> {
        let encoded = self.encode(instance)?;
        self.inputs
            .insert(instance.instance_id.as_bytes(), encoded)?;
        Ok(())
    }

    async fn get_input(&self, instance_id: &str) -> Result<Option<ExecutionInputInstance>> {
        match self.inputs.get(instance_id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn transition_input(
        &self,
        instance_id: &str,
        from: InputState,
        to: InputState,
        merged_input: Option<Value>,
    ) -> Result<Option<ExecutionInputInstance>> {
        let updated = self.inputs.transaction(
            |inputs| -> ConflictableTransactionResult<Option<ExecutionInputInstance>, EngineError> {
                let Some(raw) = inputs.get(instance_id.as_bytes())? else {
                    return abort(EngineError::InputInstanceNotFound {
                        instance_id: instance_id.to_string(),
                    });
                };
                let mut instance: ExecutionInputInstance =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                if !cas_input(&mut instance, from, to, merged_input.clone()) {
                    return Ok(None);
                }
                let encoded = self
                    .encode(&instance)
                    .map_err(ConflictableTransactionError::Abort)?;
                inputs.insert(instance_id.as_bytes(), encoded)?;
                Ok(Some(instance))
            },
        )?;
        Ok(updated)
    }

    async fn fetch_inputs_by_state(&self, state: InputState) -> Result<Vec<ExecutionInputInstance>> {
        let mut found = Vec::new();
        for entry in self.inputs.iter() {
            let (_, raw) = entry?;
            let instance: ExecutionInputInstance = decode(&raw)?;
            if instance.state == state {
                found.push(instance);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ambiance, ExecutionMode, PlanNode, StepType};

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
    async fn test_status_index_follows_cas() {
        let store = SledStore::temporary().unwrap();
        store.save(&exec("a", None)).await.unwrap();

        let running = store
            .update_status("a", &[Status::Queued], Status::Running)
            .await
            .unwrap();
        assert!(running.is_some());
        assert!(store
            .fetch_by_status(&[Status::Queued])
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.fetch_by_status(&[Status::Running]).await.unwrap().len(), 1);

        let stale = store
            .update_status("a", &[Status::Queued], Status::Running)
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_missing_record_aborts_transaction() {
        let store = SledStore::temporary().unwrap();
        let err = store
            .update_status("ghost", &[Status::Queued], Status::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeExecutionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_parent_index() {
        let store = SledStore::temporary().unwrap();
        store.save(&exec("p", None)).await.unwrap();
        store.save(&exec("c1", Some("p"))).await.unwrap();
        store.save(&exec("c2", Some("p"))).await.unwrap();
        store.save(&exec("other", Some("q"))).await.unwrap();

        let ids: Vec<String> = store
            .fetch_children("p")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"c1".to_string()));
        assert!(ids.contains(&"c2".to_string()));
    }
}
