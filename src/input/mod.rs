//! Execution-input gate
//!
//! A node whose plan node declares an input template parks in INPUT_WAITING
//! until someone supplies input or the validity window passes. The instance
//! record and the node status are both persisted, so the wait survives a
//! restart; the broker wait is re-registered by the recovery sweep.

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::NotifyBroker;
use crate::core::errors::{EngineError, Result};
use crate::core::metrics::EngineMetrics;
use crate::engine::callbacks::ExecutionInputCallback;
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::Engine;
use crate::model::{merge_inputs, ExecutionInputInstance, InputState, NodeExecution, Status};
use crate::storage::{ExecutionInputStore, NodeExecutionStore};

// Longest single sleep handed to the broker; longer windows re-arm on wake-up
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub struct ExecutionInputGate {
    engine: Weak<Engine>,
    nodes: Arc<dyn NodeExecutionStore>,
    inputs: Arc<dyn ExecutionInputStore>,
    broker: NotifyBroker,
    events: Arc<EventBus>,
    metrics: Arc<EngineMetrics>,
    validity_months: u32,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ExecutionInputGate {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: Weak<Engine>,
        nodes: Arc<dyn NodeExecutionStore>,
        inputs: Arc<dyn ExecutionInputStore>,
        broker: NotifyBroker,
        events: Arc<EventBus>,
        metrics: Arc<EngineMetrics>,
        validity_months: u32,
    ) -> Self {
        Self {
            engine,
            nodes,
            inputs,
            broker,
            events,
            metrics,
            validity_months,
            locks: DashMap::new(),
        }
    }

    /// Park a QUEUED node until input for `template` arrives.
    ///
    /// Returns the instance id, or `None` when the node was no longer QUEUED.
    pub async fn wait_for_execution_input(
        &self,
        execution: &NodeExecution,
        template: &Value,
    ) -> Result<Option<String>> {
        let instance = ExecutionInputInstance::new(
            cuid2::create_id(),
            execution.id.clone(),
            execution.ambiance.plan_execution_id.clone(),
            template.clone(),
            self.validity_months,
        );
        self.inputs.save_input(&instance).await?;

        let Some(waiting) = self
            .nodes
            .update_status(&execution.id, &[Status::Queued], Status::InputWaiting)
            .await?
        else {
            debug!(node_execution_id = %execution.id, "Node left QUEUED before input wait, dropping instance");
            self.inputs
                .transition_input(&instance.instance_id, InputState::Waiting, InputState::Expired, None)
                .await?;
            return Ok(None);
        };
        self.events.publish(EngineEvent::status_changed(&waiting));

        self.register(&instance)?;
        info!(
            node_execution_id = %execution.id,
            instance_id = %instance.instance_id,
            valid_until = %instance.valid_until,
            "Waiting for execution input"
        );
        Ok(Some(instance.instance_id))
    }

    /// Bind the instance's broker key to the input callback
    pub(crate) fn register(&self, instance: &ExecutionInputInstance) -> Result<String> {
        let callback = Arc::new(ExecutionInputCallback {
            engine: self.engine.clone(),
            node_execution_id: instance.node_execution_id.clone(),
            instance_id: instance.instance_id.clone(),
        });
        let timeout = instance.remaining(Utc::now()).min(MAX_WAIT);
        self.broker
            .register_wait(vec![instance.instance_id.clone()], callback, Some(timeout))
    }

    /// Supply input for a waiting instance.
    ///
    /// `Ok(false)` when the instance was already fulfilled or expired, or its
    /// node is no longer INPUT_WAITING. Input that fails the template's schema
    /// is rejected and the instance keeps waiting.
    ///
    /// Callers for the same instance are serialized on a per-instance mutex.
    /// The entry is only dropped once no other caller holds it, so every
    /// concurrent caller shares one mutex.
    pub async fn supply_input(&self, instance_id: &str, input: Value) -> Result<bool> {
        let lock = self
            .locks
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        let accepted = {
            let _guard = lock.lock().await;
            self.supply_locked(instance_id, input).await
        };
        drop(lock);
        // entry() and remove_if() take the same shard lock, so no clone can appear in between
        self.locks
            .remove_if(instance_id, |_, lock| Arc::strong_count(lock) == 1);
        accepted
    }

    async fn supply_locked(&self, instance_id: &str, input: Value) -> Result<bool> {
        let instance = self
            .inputs
            .get_input(instance_id)
            .await?
            .ok_or_else(|| EngineError::InputInstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        if instance.state != InputState::Waiting {
            debug!(instance_id = %instance_id, state = instance.state.as_str(), "Input already handled");
            self.metrics.record_rejected_resume();
            return Ok(false);
        }
        if instance.is_overdue(Utc::now()) {
            self.expire_instance(instance_id).await?;
            return Ok(false);
        }
        let node = self.nodes.get(&instance.node_execution_id).await?;
        let node_status = node.as_ref().map(|node| node.status);
        if node_status != Some(Status::InputWaiting) {
            debug!(
                instance_id = %instance_id,
                node_execution_id = %instance.node_execution_id,
                status = ?node_status,
                "Node not waiting for input"
            );
            // QUEUED is the short window before the node parks; keep the instance for it
            if node_status.map_or(true, Status::is_terminal) {
                self.expire_instance(instance_id).await?;
            }
            self.metrics.record_rejected_resume();
            return Ok(false);
        }

        let merged = resolve_input(&instance, input)?;
        let Some(fulfilled) = self
            .inputs
            .transition_input(
                instance_id,
                InputState::Waiting,
                InputState::Fulfilled,
                Some(merged.clone()),
            )
            .await?
        else {
            return Ok(false);
        };

        let payload = Bytes::from(serde_json::to_vec(&merged)?);
        self.broker.fulfilled(&fulfilled.instance_id, payload)?;
        info!(
            instance_id = %instance_id,
            node_execution_id = %fulfilled.node_execution_id,
            "Execution input supplied"
        );
        Ok(true)
    }

    /// Mark a waiting instance EXPIRED. The node is left as it is.
    pub async fn expire_instance(&self, instance_id: &str) -> Result<bool> {
        let Some(expired) = self
            .inputs
            .transition_input(instance_id, InputState::Waiting, InputState::Expired, None)
            .await?
        else {
            return Ok(false);
        };
        self.metrics.record_input_expired();
        warn!(
            instance_id = %instance_id,
            node_execution_id = %expired.node_execution_id,
            "Execution input expired"
        );
        self.events.publish(EngineEvent::InputExpired {
            instance_id: expired.instance_id,
            node_execution_id: expired.node_execution_id,
        });
        Ok(true)
    }

    /// Broker wait elapsed: expire if the window is over, otherwise wait again
    pub async fn on_wait_elapsed(&self, instance_id: &str) -> Result<()> {
        let Some(instance) = self.inputs.get_input(instance_id).await? else {
            return Err(EngineError::InputInstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        };
        match instance.state {
            InputState::Waiting => {}
            // Supplied while no wait was bound; the broker dropped the payload
            InputState::Fulfilled => {
                if let (Some(merged), Some(engine)) = (instance.merged_input, self.engine.upgrade()) {
                    engine
                        .resume_after_input(&instance.node_execution_id, merged)
                        .await?;
                }
                return Ok(());
            }
            InputState::Expired => return Ok(()),
        }
        if instance.is_overdue(Utc::now()) {
            self.expire_instance(instance_id).await?;
        } else {
            debug!(instance_id = %instance_id, "Input window still open, re-arming wait");
            self.register(&instance)?;
        }
        Ok(())
    }
}

fn is_schema(template: &Value) -> bool {
    match template {
        Value::Object(map) => {
            map.contains_key("$schema")
                || map.contains_key("properties")
                || map.get("type").map_or(false, Value::is_string)
        }
        _ => false,
    }
}

/// Schema templates validate the input as-is; other templates are defaults the input overrides
fn resolve_input(instance: &ExecutionInputInstance, input: Value) -> Result<Value> {
    let input = if input.is_null() { json!({}) } else { input };
    if !is_schema(&instance.template) {
        return Ok(merge_inputs(&instance.template, &input));
    }

    let validator = jsonschema::validator_for(&instance.template).map_err(|e| {
        EngineError::InvalidInput {
            instance_id: instance.instance_id.clone(),
            reason: format!("template is not a valid schema: {}", e),
        }
    })?;
    if let Err(error) = validator.validate(&input) {
        warn!(instance_id = %instance.instance_id, error = %error, "Execution input failed validation");
        return Err(EngineError::InvalidInput {
            instance_id: instance.instance_id.clone(),
            reason: error.to_string(),
        });
    }
    Ok(input)
}
