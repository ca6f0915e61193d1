//! Status-change events for observers
//!
//! Published on an overflowing broadcast channel: a slow observer loses the
//! oldest events instead of blocking the engine.

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::model::{NodeExecution, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    StatusChanged {
        node_execution_id: String,
        plan_execution_id: String,
        node_id: String,
        status: Status,
    },
    InputExpired {
        instance_id: String,
        node_execution_id: String,
    },
    PlanCompleted {
        plan_execution_id: String,
        node_execution_id: String,
        status: Status,
    },
}

impl EngineEvent {
    pub fn status_changed(execution: &NodeExecution) -> Self {
        EngineEvent::StatusChanged {
            node_execution_id: execution.id.clone(),
            plan_execution_id: execution.ambiance.plan_execution_id.clone(),
            node_id: execution.node.node_id.clone(),
            status: execution.status,
        }
    }
}

/// Event with sequence number and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: EngineEvent,
}

pub struct EventBus {
    sender: Sender<EngineEventEnvelope>,
    // Keeps the channel open while nobody listens
    _keepalive: InactiveReceiver<EngineEventEnvelope>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        Self {
            sender,
            _keepalive: receiver.deactivate(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        let envelope = EngineEventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };
        // Inactive (no subscribers) is not an error
        if let Err(e) = self.sender.try_broadcast(envelope) {
            trace!(error = %e, "Event not delivered");
        }
    }

    pub fn subscribe(&self) -> Receiver<EngineEventEnvelope> {
        self.sender.new_receiver()
    }
}
