use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::Status;

/// Engine errors with classification helpers
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors: a bad plan compile, never a runtime condition
    #[error("Unknown execution mode: {mode}")]
    UnknownExecutionMode { mode: String },

    #[error("Malformed plan {plan_id}: {reason}")]
    MalformedPlan { plan_id: String, reason: String },

    #[error("No step handler registered for step type {step_type}")]
    StepHandlerNotFound { step_type: String },

    #[error("Step type {step_type} cannot run in mode {mode}: handler is {handler}")]
    ModeMismatch {
        step_type: String,
        mode: String,
        handler: String,
    },

    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    // Lookup errors
    #[error("Node execution not found: {node_execution_id}")]
    NodeExecutionNotFound { node_execution_id: String },

    #[error("Node execution already exists: {node_execution_id}")]
    NodeExecutionExists { node_execution_id: String },

    #[error("Plan not registered: {plan_id}")]
    PlanNotFound { plan_id: String },

    #[error("Plan node not found: {node_id} in plan {plan_id}")]
    PlanNodeNotFound { plan_id: String, node_id: String },

    #[error("Execution input instance not found: {instance_id}")]
    InputInstanceNotFound { instance_id: String },

    // State errors
    #[error("Node execution {node_execution_id} is terminal ({status:?}) and cannot be mutated")]
    TerminalNode {
        node_execution_id: String,
        status: Status,
    },

    #[error("Illegal status transition for {node_execution_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        node_execution_id: String,
        from: Status,
        to: Status,
    },

    #[error("Unexpected executable response for {node_execution_id}: {reason}")]
    UnexpectedResponse {
        node_execution_id: String,
        reason: String,
    },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Collaborator errors
    #[error("Broker delivery failed for {correlation_key}: {reason}")]
    BrokerDelivery {
        correlation_key: String,
        reason: String,
    },

    #[error("Task dispatch failed for {correlation_id}: {reason}")]
    TaskDispatch {
        correlation_id: String,
        reason: String,
    },

    #[error("Timeout engine error: {0}")]
    TimeoutEngine(String),

    #[error("Invalid execution input for {instance_id}: {reason}")]
    InvalidInput { instance_id: String, reason: String },

    // System errors
    #[error("Engine shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(node_execution_id: impl Into<String>) -> Self {
        Self::NodeExecutionNotFound {
            node_execution_id: node_execution_id.into(),
        }
    }

    pub fn malformed_plan(plan_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPlan {
            plan_id: plan_id.into(),
            reason: reason.into(),
        }
    }

    /// Configuration errors indicate a bad plan or setup and are never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownExecutionMode { .. }
                | Self::MalformedPlan { .. }
                | Self::StepHandlerNotFound { .. }
                | Self::ModeMismatch { .. }
                | Self::InvalidConfiguration(_)
                | Self::PlanNotFound { .. }
                | Self::PlanNodeNotFound { .. }
        )
    }

    /// Check if the caller of the failed operation may retry it
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::BrokerDelivery { .. }
            | Self::TaskDispatch { .. }
            | Self::TimeoutEngine(_) => true,
            _ => false,
        }
    }

    /// Check if this error indicates store write contention
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Database(_) | Self::BrokerDelivery { .. } => true,
            _ => false,
        }
    }

    /// Get suggested retry delay for this error
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Database(_) | Self::Storage(_) => Some(Duration::from_millis(200)),
            Self::BrokerDelivery { .. } => Some(Duration::from_millis(100)),
            Self::Io(_) => Some(Duration::from_secs(1)),
            _ if self.is_retryable() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<sled::transaction::TransactionError<EngineError>> for EngineError {
    fn from(e: sled::transaction::TransactionError<EngineError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(inner) => EngineError::Database(inner),
        }
    }
}
