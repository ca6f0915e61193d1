use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::core::errors::Result;
use crate::model::{FailureInfo, NodeExecution, Status};

/// Raw broker responses keyed by wait key (or by child plan node id after accumulation)
pub type ResponseMap = HashMap<String, Bytes>;

/// Payload a finished child sends to its parent through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNotifyData {
    pub node_id: String,
    pub identifier: String,
    pub node_execution_id: String,
    pub status: Status,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub outcome: Option<Value>,
}

impl StepNotifyData {
    pub fn from_execution(exec: &NodeExecution) -> Self {
        Self {
            node_id: exec.node.node_id.clone(),
            identifier: exec.node.identifier.clone(),
            node_execution_id: exec.id.clone(),
            status: exec.status,
            failure: exec.failure.clone(),
            outcome: exec.outcome.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Terminal result an external task sends back for a correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: Status,
    #[serde(default)]
    pub outcome: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskResult {
    pub fn succeeded(outcome: Value) -> Self {
        Self {
            status: Status::Succeeded,
            outcome: Some(outcome),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            outcome: None,
            error_message: Some(message.into()),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
