//! Step handlers
//!
//! Each execution mode has its own step trait. A step type is registered with
//! exactly one handler; the handler's kind must match the mode the plan node
//! declares. Handlers return `anyhow::Result`: an `Err` is a business failure
//! and terminates the node as FAILED, it is never an engine error.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{EngineError, Result};
use crate::model::{
    Ambiance, ExecutionMode, FailureInfo, PlanNode, ResponseMap, Status, StepNotifyData, StepType,
    TaskResult,
};

/// What a step sees when it runs
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub plan_node: PlanNode,
    /// Step parameters merged with any supplied execution input
    pub inputs: Value,
}

/// Final result of a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub status: Status,
    pub outcome: Option<Value>,
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            outcome: None,
            failure: None,
        }
    }

    pub fn with_outcome(status: Status, outcome: Value) -> Self {
        Self {
            status,
            outcome: Some(outcome),
            failure: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: Status::Skipped,
            outcome: None,
            failure: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            outcome: None,
            failure: Some(FailureInfo::application(message)),
        }
    }
}

/// Accumulated child results keyed by child plan node id
pub type ChildResponses = BTreeMap<String, StepNotifyData>;

/// Decode an accumulated response map; entries that are not notify data are skipped
pub fn decode_child_responses(responses: &ResponseMap) -> ChildResponses {
    responses
        .iter()
        .filter_map(|(key, raw)| {
            StepNotifyData::from_bytes(raw)
                .ok()
                .map(|data| (key.clone(), data))
        })
        .collect()
}

/// Default resume for fan-out steps: aggregate child statuses
pub fn aggregate_children(responses: &ChildResponses) -> StepResponse {
    let status = Status::aggregate(responses.values().map(|r| r.status));
    let failure = responses
        .values()
        .find(|r| r.status == status && r.failure.is_some())
        .and_then(|r| r.failure.clone());
    let outcome = Value::Object(
        responses
            .iter()
            .map(|(node_id, r)| {
                let entry = serde_json::json!({ "status": r.status, "outcome": r.outcome });
                (node_id.clone(), entry)
            })
            .collect(),
    );
    StepResponse {
        status,
        outcome: Some(outcome),
        failure,
    }
}

/// Work handed to the external task executor
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_type: String,
    pub payload: Bytes,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }
}

/// Default task resume: read the single task result delivered for the node
pub fn task_response(responses: &ResponseMap) -> StepResponse {
    let Some(raw) = responses.values().next() else {
        return StepResponse::failed("no task response delivered");
    };
    match TaskResult::from_bytes(raw) {
        Ok(result) if result.status.is_terminal() => StepResponse {
            status: result.status,
            outcome: result.outcome,
            failure: result.error_message.map(FailureInfo::application),
        },
        Ok(result) => StepResponse::failed(format!(
            "task reported non-terminal status {}",
            result.status
        )),
        Err(e) => StepResponse::failed(format!("undecodable task response: {}", e)),
    }
}

#[async_trait]
pub trait SyncStep: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResponse>;
}

#[async_trait]
pub trait AsyncStep: Send + Sync {
    /// Kick off work and return the callback ids it will report on
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<Vec<String>>;

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse>;
}

#[async_trait]
pub trait ChildStep: Send + Sync {
    /// Plan node id of the single child; the declared child by default
    async fn obtain_child(&self, ctx: &StepContext) -> anyhow::Result<String> {
        ctx.plan_node
            .children
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node {} declares no child", ctx.plan_node.id))
    }

    async fn handle_child_response(
        &self,
        _ctx: &StepContext,
        responses: &ChildResponses,
    ) -> anyhow::Result<StepResponse> {
        Ok(aggregate_children(responses))
    }
}

#[async_trait]
pub trait ChildrenStep: Send + Sync {
    /// Plan node ids started in parallel; all declared children by default
    async fn obtain_children(&self, ctx: &StepContext) -> anyhow::Result<Vec<String>> {
        Ok(ctx.plan_node.children.clone())
    }

    async fn handle_children_response(
        &self,
        _ctx: &StepContext,
        responses: &ChildResponses,
    ) -> anyhow::Result<StepResponse> {
        Ok(aggregate_children(responses))
    }
}

/// One link of a child chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChainLink {
    /// Child plan node to start; `None` ends the chain
    pub child_node_id: Option<String>,
    /// State carried to the next link
    pub pass_through: Value,
    /// Finalize once this child reports
    pub last_link: bool,
    /// End the chain now without starting anything
    pub suspend: bool,
}

impl ChildChainLink {
    pub fn child(child_node_id: impl Into<String>, pass_through: Value) -> Self {
        Self {
            child_node_id: Some(child_node_id.into()),
            pass_through,
            last_link: false,
            suspend: false,
        }
    }

    pub fn last(child_node_id: impl Into<String>, pass_through: Value) -> Self {
        Self {
            last_link: true,
            ..Self::child(child_node_id, pass_through)
        }
    }

    pub fn suspend(pass_through: Value) -> Self {
        Self {
            child_node_id: None,
            pass_through,
            last_link: false,
            suspend: true,
        }
    }
}

#[async_trait]
pub trait ChildChainStep: Send + Sync {
    async fn execute_first_child(&self, ctx: &StepContext) -> anyhow::Result<ChildChainLink>;

    async fn execute_next_child(
        &self,
        ctx: &StepContext,
        pass_through: &Value,
        responses: &ChildResponses,
    ) -> anyhow::Result<ChildChainLink>;

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        _pass_through: &Value,
        responses: &ChildResponses,
    ) -> anyhow::Result<StepResponse> {
        Ok(aggregate_children(responses))
    }
}

#[async_trait]
pub trait TaskStep: Send + Sync {
    async fn obtain_task(&self, ctx: &StepContext) -> anyhow::Result<TaskRequest>;

    async fn handle_task_result(
        &self,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        Ok(task_response(responses))
    }
}

/// One link of a task chain
#[derive(Debug, Clone, PartialEq)]
pub struct TaskChainLink {
    /// Task to dispatch; `None` means nothing is left and the chain finalizes
    pub task: Option<TaskRequest>,
    pub pass_through: Value,
    /// Finalize once this link's task reports
    pub chain_end: bool,
}

impl TaskChainLink {
    pub fn task(task: TaskRequest, pass_through: Value) -> Self {
        Self {
            task: Some(task),
            pass_through,
            chain_end: false,
        }
    }

    pub fn end_with(task: TaskRequest, pass_through: Value) -> Self {
        Self {
            task: Some(task),
            pass_through,
            chain_end: true,
        }
    }

    pub fn done(pass_through: Value) -> Self {
        Self {
            task: None,
            pass_through,
            chain_end: true,
        }
    }
}

#[async_trait]
pub trait TaskChainStep: Send + Sync {
    /// Next link; `previous` is empty for the first link
    async fn start_chain_link(
        &self,
        ctx: &StepContext,
        pass_through: &Value,
        previous: &ResponseMap,
    ) -> anyhow::Result<TaskChainLink>;

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        _pass_through: &Value,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        if responses.is_empty() {
            return Ok(StepResponse::succeeded());
        }
        Ok(task_response(responses))
    }
}

/// A registered handler, tagged by the mode family it serves
#[derive(Clone)]
pub enum StepHandler {
    Sync(Arc<dyn SyncStep>),
    Async(Arc<dyn AsyncStep>),
    Child(Arc<dyn ChildStep>),
    Children(Arc<dyn ChildrenStep>),
    ChildChain(Arc<dyn ChildChainStep>),
    Task(Arc<dyn TaskStep>),
    TaskChain(Arc<dyn TaskChainStep>),
}

impl StepHandler {
    pub fn kind(&self) -> &'static str {
        match self {
            StepHandler::Sync(_) => "SYNC",
            StepHandler::Async(_) => "ASYNC",
            StepHandler::Child(_) => "CHILD",
            StepHandler::Children(_) => "CHILDREN",
            StepHandler::ChildChain(_) => "CHILD_CHAIN",
            StepHandler::Task(_) => "TASK",
            StepHandler::TaskChain(_) => "TASK_CHAIN",
        }
    }

    pub fn supports(&self, mode: ExecutionMode) -> bool {
        matches!(
            (self, mode),
            (StepHandler::Sync(_), ExecutionMode::Sync)
                | (StepHandler::Async(_), ExecutionMode::Async)
                | (StepHandler::Child(_), ExecutionMode::Child)
                | (StepHandler::Children(_), ExecutionMode::Children)
                | (StepHandler::ChildChain(_), ExecutionMode::ChildChain)
                | (StepHandler::Task(_), ExecutionMode::Task(_))
                | (StepHandler::TaskChain(_), ExecutionMode::TaskChain(_))
        )
    }
}

impl std::fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StepHandler::{}", self.kind())
    }
}

/// Step handlers keyed by step type name
#[derive(Default)]
pub struct StepRegistry {
    handlers: DashMap<String, StepHandler>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step_type: impl Into<String>, handler: StepHandler) {
        let step_type = step_type.into();
        debug!(step_type = %step_type, kind = handler.kind(), "Registered step handler");
        self.handlers.insert(step_type, handler);
    }

    pub fn register_sync(&self, step_type: impl Into<String>, step: impl SyncStep + 'static) {
        self.register(step_type, StepHandler::Sync(Arc::new(step)));
    }

    pub fn register_async(&self, step_type: impl Into<String>, step: impl AsyncStep + 'static) {
        self.register(step_type, StepHandler::Async(Arc::new(step)));
    }

    pub fn register_child(&self, step_type: impl Into<String>, step: impl ChildStep + 'static) {
        self.register(step_type, StepHandler::Child(Arc::new(step)));
    }

    pub fn register_children(
        &self,
        step_type: impl Into<String>,
        step: impl ChildrenStep + 'static,
    ) {
        self.register(step_type, StepHandler::Children(Arc::new(step)));
    }

    pub fn register_child_chain(
        &self,
        step_type: impl Into<String>,
        step: impl ChildChainStep + 'static,
    ) {
        self.register(step_type, StepHandler::ChildChain(Arc::new(step)));
    }

    pub fn register_task(&self, step_type: impl Into<String>, step: impl TaskStep + 'static) {
        self.register(step_type, StepHandler::Task(Arc::new(step)));
    }

    pub fn register_task_chain(
        &self,
        step_type: impl Into<String>,
        step: impl TaskChainStep + 'static,
    ) {
        self.register(step_type, StepHandler::TaskChain(Arc::new(step)));
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Handler for `step_type`, checked against the node's declared mode
    pub fn resolve(&self, step_type: &StepType, mode: ExecutionMode) -> Result<StepHandler> {
        let handler = self
            .handlers
            .get(&step_type.name)
            .map(|h| h.value().clone())
            .ok_or_else(|| EngineError::StepHandlerNotFound {
                step_type: step_type.name.clone(),
            })?;
        if !handler.supports(mode) {
            return Err(EngineError::ModeMismatch {
                step_type: step_type.name.clone(),
                mode: mode.to_string(),
                handler: handler.kind().to_string(),
            });
        }
        Ok(handler)
    }
}

/// Step that succeeds immediately with its inputs as outcome
pub struct PassThroughStep;

#[async_trait]
impl SyncStep for PassThroughStep {
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::with_outcome(Status::Succeeded, ctx.inputs.clone()))
    }
}

/// Fan-out step that starts every declared child and aggregates their statuses
pub struct DeclaredChildrenStep;

impl ChildrenStep for DeclaredChildrenStep {}

/// Single-child wrapper that aggregates its child's status
pub struct DeclaredChildStep;

impl ChildStep for DeclaredChildStep {}

/// Chain over `children` in declared order, one link per child.
///
/// Stops at the first child that did not succeed and reports its status.
pub struct DeclaredChildChainStep;

#[async_trait]
impl ChildChainStep for DeclaredChildChainStep {
    async fn execute_first_child(&self, ctx: &StepContext) -> anyhow::Result<ChildChainLink> {
        Ok(link_at(ctx, 0))
    }

    async fn execute_next_child(
        &self,
        ctx: &StepContext,
        pass_through: &Value,
        responses: &ChildResponses,
    ) -> anyhow::Result<ChildChainLink> {
        let aggregated = aggregate_children(responses);
        if !aggregated.status.is_positive() {
            let mut state = pass_through.clone();
            state["status"] = serde_json::to_value(aggregated.status)?;
            state["failure"] = serde_json::to_value(&aggregated.failure)?;
            return Ok(ChildChainLink::suspend(state));
        }
        let index = pass_through["index"].as_u64().unwrap_or(0) as usize;
        Ok(link_at(ctx, index + 1))
    }

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        pass_through: &Value,
        responses: &ChildResponses,
    ) -> anyhow::Result<StepResponse> {
        if pass_through.get("status").is_some() {
            return Ok(StepResponse {
                status: serde_json::from_value(pass_through["status"].clone())?,
                outcome: None,
                failure: serde_json::from_value(pass_through["failure"].clone())?,
            });
        }
        Ok(aggregate_children(responses))
    }
}

fn link_at(ctx: &StepContext, index: usize) -> ChildChainLink {
    let children = &ctx.plan_node.children;
    let state = serde_json::json!({ "index": index });
    match children.get(index) {
        Some(child) if index + 1 == children.len() => ChildChainLink::last(child, state),
        Some(child) => ChildChainLink::child(child, state),
        None => ChildChainLink::suspend(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskProtocol;
    use serde_json::json;

    fn notify(node_id: &str, status: Status) -> StepNotifyData {
        StepNotifyData {
            node_id: node_id.into(),
            identifier: node_id.into(),
            node_execution_id: format!("exec-{}", node_id),
            status,
            failure: (status == Status::Failed).then(|| FailureInfo::application("boom")),
            outcome: None,
        }
    }

    #[test]
    fn test_resolve_checks_mode() {
        let registry = StepRegistry::new();
        registry.register_sync("ECHO", PassThroughStep);

        assert!(registry
            .resolve(&StepType::step("ECHO"), ExecutionMode::Sync)
            .is_ok());

        let err = registry
            .resolve(&StepType::step("ECHO"), ExecutionMode::Task(TaskProtocol::V2))
            .unwrap_err();
        assert!(matches!(err, EngineError::ModeMismatch { .. }));
        assert!(err.is_configuration());

        let err = registry
            .resolve(&StepType::step("MISSING"), ExecutionMode::Sync)
            .unwrap_err();
        assert!(matches!(err, EngineError::StepHandlerNotFound { .. }));
    }

    #[test]
    fn test_aggregate_children_reflects_failure() {
        let mut responses = ChildResponses::new();
        responses.insert("a".into(), notify("a", Status::Succeeded));
        responses.insert("b".into(), notify("b", Status::Failed));

        let response = aggregate_children(&responses);
        assert_eq!(response.status, Status::Failed);
        assert_eq!(response.failure.unwrap().message, "boom");
        let outcome = response.outcome.unwrap();
        assert_eq!(outcome["a"]["status"], json!("SUCCEEDED"));
        assert_eq!(outcome["b"]["status"], json!("FAILED"));
    }

    #[test]
    fn test_task_response_decoding() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "corr".into(),
            TaskResult::succeeded(json!({"rows": 3})).to_bytes().unwrap(),
        );
        let response = task_response(&responses);
        assert_eq!(response.status, Status::Succeeded);
        assert_eq!(response.outcome, Some(json!({"rows": 3})));

        responses.insert("corr".into(), Bytes::from_static(b"not json"));
        assert_eq!(task_response(&responses).status, Status::Failed);
    }
}
