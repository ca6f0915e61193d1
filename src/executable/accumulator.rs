use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::trace;

use crate::core::errors::{EngineError, Result};
use crate::model::{ExecutableResponse, ExecutionMode, NodeExecution, ResponseMap, StepNotifyData};
use crate::storage::NodeExecutionStore;

/// Builds the response map handed to a resuming strategy.
///
/// Fan-out parents get one entry per direct child keyed by the child's plan
/// node id, whether or not the child produced output. Everything else gets
/// the broker responses unchanged.
pub struct ResponseAccumulator {
    store: Arc<dyn NodeExecutionStore>,
}

impl ResponseAccumulator {
    pub fn new(store: Arc<dyn NodeExecutionStore>) -> Self {
        Self { store }
    }

    pub fn requires_accumulation(execution: &NodeExecution) -> bool {
        match execution.mode() {
            ExecutionMode::Child | ExecutionMode::Children => true,
            ExecutionMode::ChildChain => !matches!(
                execution.last_response(),
                Some(ExecutableResponse::ChildChain { suspend: true, .. })
            ),
            _ => false,
        }
    }

    pub async fn build_response_map(
        &self,
        execution: &NodeExecution,
        immediate: ResponseMap,
    ) -> Result<ResponseMap> {
        if !Self::requires_accumulation(execution) {
            return Ok(immediate);
        }

        let children = self.store.fetch_children(&execution.id).await?;
        let mut accumulated = ResponseMap::with_capacity(children.len());
        for child in &children {
            match accumulated.entry(child.node.node_id.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::malformed_plan(
                        &execution.node.plan_id,
                        format!(
                            "node execution {} has more than one child for plan node {}",
                            execution.id, child.node.node_id
                        ),
                    ));
                }
                Entry::Vacant(slot) => {
                    slot.insert(StepNotifyData::from_execution(child).to_bytes()?);
                }
            }
        }
        trace!(
            node_execution_id = %execution.id,
            children = accumulated.len(),
            "Accumulated child responses"
        );
        Ok(accumulated)
    }
}
