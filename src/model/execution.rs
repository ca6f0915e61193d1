use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::{EngineError, Result};
use crate::model::{Ambiance, ExecutionMode, PlanNode, Status, StepType, TaskProtocol};

/// Reference to the static plan node a run belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNodeRef {
    pub plan_id: String,
    pub node_id: String,
    pub identifier: String,
    pub mode: ExecutionMode,
    pub step_type: StepType,
}

impl PlanNodeRef {
    pub fn from_node(plan_id: &str, node: &PlanNode) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            node_id: node.id.clone(),
            identifier: node.identifier.clone(),
            mode: node.mode,
            step_type: node.step_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Application,
    Timeout,
    Configuration,
    Delivery,
    Interrupted,
    Aborted,
}

/// Failure detail attached to a FAILED/ERRORED/EXPIRED/ABORTED run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(failure_type: FailureType, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureType::Application, message)
    }
}

/// A spawned child: which plan node, which run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInstance {
    pub node_id: String,
    pub execution_id: String,
}

/// What a strategy recorded when it suspended the node
///
/// The last entry is the continuation state used by resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Async {
        callback_ids: Vec<String>,
    },
    Child {
        child: ChildInstance,
    },
    Children {
        children: Vec<ChildInstance>,
    },
    ChildChain {
        child: Option<ChildInstance>,
        pass_through: Value,
        last_link: bool,
        suspend: bool,
    },
    Task {
        correlation_id: String,
        task_type: String,
        protocol: TaskProtocol,
    },
    TaskChain {
        correlation_id: Option<String>,
        task_type: Option<String>,
        protocol: TaskProtocol,
        pass_through: Value,
        chain_end: bool,
    },
}

impl ExecutableResponse {
    /// Correlation keys the node waits on while this response is the last
    pub fn wait_keys(&self) -> Vec<String> {
        match self {
            ExecutableResponse::Async { callback_ids } => callback_ids.clone(),
            ExecutableResponse::Child { child } => vec![child.execution_id.clone()],
            ExecutableResponse::Children { children } => {
                children.iter().map(|c| c.execution_id.clone()).collect()
            }
            ExecutableResponse::ChildChain { child, suspend, .. } => match child {
                Some(child) if !suspend => vec![child.execution_id.clone()],
                _ => Vec::new(),
            },
            ExecutableResponse::Task { correlation_id, .. } => vec![correlation_id.clone()],
            ExecutableResponse::TaskChain { correlation_id, .. } => {
                correlation_id.iter().cloned().collect()
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutableResponse::Async { .. } => "ASYNC",
            ExecutableResponse::Child { .. } => "CHILD",
            ExecutableResponse::Children { .. } => "CHILDREN",
            ExecutableResponse::ChildChain { .. } => "CHILD_CHAIN",
            ExecutableResponse::Task { .. } => "TASK",
            ExecutableResponse::TaskChain { .. } => "TASK_CHAIN",
        }
    }
}

/// Runtime record of one run of one plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub ambiance: Ambiance,
    pub node: PlanNodeRef,
    pub status: Status,

    // Hierarchy, all resolved through the store
    pub parent_id: Option<String>,
    /// Key the parent waits on; inherited by next siblings and retries
    pub notify_id: Option<String>,
    pub previous_id: Option<String>,

    // Retry bookkeeping
    pub retry_count: u32,
    pub retried_from: Option<String>,
    pub retry_ids: Vec<String>,
    pub old_retry: bool,

    // Continuation state
    pub executable_responses: Vec<ExecutableResponse>,
    pub timeout_instance_ids: Vec<String>,
    pub resolved_input: Option<Value>,

    // Outcome
    pub outcome: Option<Value>,
    pub failure: Option<FailureInfo>,
    /// Set once the final advice for this run has been carried out
    pub concluded: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// A fresh QUEUED run of `node`
    pub fn queued(
        id: impl Into<String>,
        ambiance: Ambiance,
        plan_id: &str,
        node: &PlanNode,
        parent_id: Option<String>,
        notify_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            ambiance,
            node: PlanNodeRef::from_node(plan_id, node),
            status: Status::Queued,
            parent_id,
            notify_id,
            previous_id: None,
            retry_count: 0,
            retried_from: None,
            retry_ids: Vec::new(),
            old_retry: false,
            executable_responses: Vec::new(),
            timeout_instance_ids: Vec::new(),
            resolved_input: None,
            outcome: None,
            failure: None,
            concluded: false,
            created_at: now,
            updated_at: now,
            start_ts: None,
            end_ts: None,
        }
    }

    pub fn last_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.node.mode
    }

    /// Compare-and-set on status: applies `to` and `ops` only when the current
    /// status is in `allowed_from` and the transition is legal
    pub fn try_transition(
        &mut self,
        allowed_from: &[Status],
        to: Status,
        ops: Vec<NodeUpdate>,
    ) -> bool {
        if !allowed_from.contains(&self.status) || !self.status.can_transition_to(to) {
            return false;
        }
        let now = Utc::now();
        self.status = to;
        if to == Status::Running && self.start_ts.is_none() {
            self.start_ts = Some(now);
        }
        if to.is_terminal() {
            self.end_ts = Some(now);
        }
        for op in ops {
            op.apply(self);
        }
        self.updated_at = now;
        true
    }

    /// Apply updates without a status change; terminal runs only accept bookkeeping
    pub fn apply_updates(&mut self, ops: Vec<NodeUpdate>) -> Result<()> {
        if self.status.is_terminal() && ops.iter().any(|op| !op.is_bookkeeping()) {
            return Err(EngineError::TerminalNode {
                node_execution_id: self.id.clone(),
                status: self.status,
            });
        }
        for op in ops {
            op.apply(self);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Field-level mutations applied atomically with (or without) a status change
#[derive(Debug, Clone, PartialEq)]
pub enum NodeUpdate {
    AppendResponse(ExecutableResponse),
    AddTimeoutInstances(Vec<String>),
    ClearTimeoutInstances,
    SetFailure(FailureInfo),
    SetOutcome(Value),
    SetResolvedInput(Value),
    MarkOldRetry,
    AddRetryId(String),
    MarkConcluded,
}

impl NodeUpdate {
    /// Updates allowed after the run is terminal; none of them touch the outcome
    pub fn is_bookkeeping(&self) -> bool {
        matches!(
            self,
            NodeUpdate::ClearTimeoutInstances
                | NodeUpdate::MarkOldRetry
                | NodeUpdate::AddRetryId(_)
                | NodeUpdate::MarkConcluded
        )
    }

    fn apply(self, exec: &mut NodeExecution) {
        match self {
            NodeUpdate::AppendResponse(response) => exec.executable_responses.push(response),
            NodeUpdate::AddTimeoutInstances(ids) => exec.timeout_instance_ids.extend(ids),
            NodeUpdate::ClearTimeoutInstances => exec.timeout_instance_ids.clear(),
            NodeUpdate::SetFailure(failure) => exec.failure = Some(failure),
            NodeUpdate::SetOutcome(outcome) => exec.outcome = Some(outcome),
            NodeUpdate::SetResolvedInput(input) => exec.resolved_input = Some(input),
            NodeUpdate::MarkOldRetry => exec.old_retry = true,
            NodeUpdate::AddRetryId(id) => exec.retry_ids.push(id),
            NodeUpdate::MarkConcluded => exec.concluded = true,
        }
    }
}
