use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::core::errors::Result;
use crate::engine::{Engine, EngineJob};
use crate::model::{InputState, NodeExecution, Status, StepNotifyData};

/// Counters reported by a status sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    pub inputs_expired: usize,
    pub inputs_rearmed: usize,
    pub inputs_replayed: usize,
    pub queued_resubmitted: usize,
    pub running_errored: usize,
    pub waits_restored: usize,
    pub children_replayed: usize,
    pub advice_replayed: usize,
    pub failed: usize,
}

impl RecoveryStats {
    pub fn is_empty(&self) -> bool {
        *self == RecoveryStats::default()
    }
}

/// Rebuilds in-memory engine state from the store after a restart.
///
/// Everything the broker held is gone after a restart, so every suspended
/// node gets its wait re-registered from its last persisted response and
/// finished children are reported again. The sweep assumes no jobs are in
/// flight; run it before new work is submitted.
pub struct Recovery {
    engine: Arc<Engine>,
}

impl Recovery {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn sweep(&self) -> Result<RecoveryStats> {
        info!("Starting status sweep");
        let mut stats = RecoveryStats::default();

        self.sweep_inputs(&mut stats).await?;

        let config = self.engine.config();
        if config.resubmit_queued_on_recovery {
            for exec in self.store_fetch(&[Status::Queued]).await? {
                debug!(node_execution_id = %exec.id, "Resubmitting queued node");
                self.engine.submit(EngineJob::Start {
                    node_execution_id: exec.id,
                });
                stats.queued_resubmitted += 1;
            }
        }

        for exec in self.store_fetch(&[Status::Running]).await? {
            if exec.executable_responses.is_empty() {
                if !config.error_interrupted_on_recovery {
                    continue;
                }
                match self.engine.interrupt_node(&exec.id).await {
                    Ok(true) => stats.running_errored += 1,
                    Ok(false) => {}
                    Err(e) => self.failed(&mut stats, &exec, e),
                }
            } else if let Err(e) = self.restore_wait(&exec, &mut stats).await {
                self.failed(&mut stats, &exec, e);
            }
        }

        for exec in self
            .store_fetch(&[Status::AsyncWaiting, Status::TaskWaiting])
            .await?
        {
            if let Err(e) = self.restore_wait(&exec, &mut stats).await {
                self.failed(&mut stats, &exec, e);
            }
        }

        for exec in self.store_fetch(&Status::TERMINAL).await? {
            if exec.concluded || exec.old_retry {
                continue;
            }
            match self.engine.conclude_with_advice(&exec).await {
                Ok(()) => stats.advice_replayed += 1,
                Err(e) => self.failed(&mut stats, &exec, e),
            }
        }

        info!(
            inputs_expired = stats.inputs_expired,
            queued_resubmitted = stats.queued_resubmitted,
            running_errored = stats.running_errored,
            waits_restored = stats.waits_restored,
            advice_replayed = stats.advice_replayed,
            failed = stats.failed,
            "Status sweep completed"
        );
        Ok(stats)
    }

    async fn sweep_inputs(&self, stats: &mut RecoveryStats) -> Result<()> {
        let gate = self.engine.input_gate();
        let inputs = self.engine.input_store();
        let now = Utc::now();

        for instance in inputs.fetch_inputs_by_state(InputState::Waiting).await? {
            if instance.is_overdue(now) {
                if gate.expire_instance(&instance.instance_id).await? {
                    stats.inputs_expired += 1;
                }
            } else if !self.engine.broker().is_waiting_on(&instance.instance_id) {
                gate.register(&instance)?;
                stats.inputs_rearmed += 1;
            }
        }

        // Input accepted but the node never left INPUT_WAITING
        for instance in inputs.fetch_inputs_by_state(InputState::Fulfilled).await? {
            let Some(merged) = instance.merged_input else {
                continue;
            };
            let node = self
                .engine
                .node_store()
                .get(&instance.node_execution_id)
                .await?;
            if node.map_or(false, |n| n.status == Status::InputWaiting)
                && self
                    .engine
                    .resume_after_input(&instance.node_execution_id, merged)
                    .await?
            {
                stats.inputs_replayed += 1;
            }
        }
        Ok(())
    }

    /// Re-register the wait of a suspended node and replay finished children
    async fn restore_wait(&self, exec: &NodeExecution, stats: &mut RecoveryStats) -> Result<()> {
        let Some(response) = exec.last_response() else {
            return Ok(());
        };
        let keys = response.wait_keys();
        let broker = self.engine.broker();
        if keys.iter().any(|key| broker.is_waiting_on(key)) {
            return Ok(());
        }
        self.engine.register_resume(&exec.id, keys.clone())?;
        stats.waits_restored += 1;
        debug!(node_execution_id = %exec.id, wait_keys = keys.len(), "Restored wait");

        if !exec.mode().is_parent() {
            return Ok(());
        }
        let keys: HashSet<String> = keys.into_iter().collect();
        let children = self.engine.node_store().fetch_children(&exec.id).await?;
        let superseded: HashSet<&str> = children
            .iter()
            .filter_map(|child| child.previous_id.as_deref())
            .collect();
        for child in &children {
            if !child.status.is_terminal() || !child.concluded || superseded.contains(child.id.as_str()) {
                continue;
            }
            let key = child.notify_id.clone().unwrap_or_else(|| child.id.clone());
            if !keys.contains(&key) {
                continue;
            }
            broker.fulfilled(&key, StepNotifyData::from_execution(child).to_bytes()?)?;
            stats.children_replayed += 1;
        }
        Ok(())
    }

    async fn store_fetch(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>> {
        self.engine.node_store().fetch_by_status(statuses).await
    }

    fn failed(&self, stats: &mut RecoveryStats, exec: &NodeExecution, e: crate::core::errors::EngineError) {
        error!(node_execution_id = %exec.id, error = %e, "Failed to recover node execution");
        stats.failed += 1;
    }
}
