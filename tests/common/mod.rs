//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use stagehand::{
    AsyncStep, Engine, EngineConfig, ExecutionMode, MemoryStore, NodeExecution, Plan, PlanNode,
    ResponseMap, Status, StepContext, StepRegistry, StepResponse, StepType, SyncStep,
    TaskChainLink, TaskChainStep, TaskDispatch, TaskExecutor, TaskRequest, TaskStep,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Task executor that hands every dispatch to the test
pub struct ChannelTaskExecutor {
    tx: mpsc::UnboundedSender<TaskDispatch>,
}

pub fn task_channel() -> (Arc<ChannelTaskExecutor>, mpsc::UnboundedReceiver<TaskDispatch>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelTaskExecutor { tx }), rx)
}

#[async_trait]
impl TaskExecutor for ChannelTaskExecutor {
    async fn dispatch(&self, task: TaskDispatch) -> stagehand::Result<()> {
        self.tx
            .send(task)
            .map_err(|e| stagehand::EngineError::internal(e.to_string()))
    }
}

pub async fn next_dispatch(rx: &mut mpsc::UnboundedReceiver<TaskDispatch>) -> TaskDispatch {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no task dispatched in time")
        .expect("task channel closed")
}

/// Fails with an application error
pub struct FailStep;

#[async_trait]
impl SyncStep for FailStep {
    async fn execute(&self, _ctx: &StepContext) -> anyhow::Result<StepResponse> {
        anyhow::bail!("step exploded")
    }
}

/// Waits on `cb-<node_execution_id>` and succeeds with the delivered JSON
pub struct CallbackStep;

pub fn callback_id(node_execution_id: &str) -> String {
    format!("cb-{}", node_execution_id)
}

#[async_trait]
impl AsyncStep for CallbackStep {
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<Vec<String>> {
        Ok(vec![callback_id(&ctx.node_execution_id)])
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        let raw = responses
            .values()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no callback response"))?;
        let outcome: Value = serde_json::from_slice(raw)?;
        let status = match outcome["status"].as_str() {
            Some("FAILED") => Status::Failed,
            _ => Status::Succeeded,
        };
        Ok(StepResponse::with_outcome(status, outcome))
    }
}

/// Dispatches the node's parameters as one task
pub struct ParamsTask;

#[async_trait]
impl TaskStep for ParamsTask {
    async fn obtain_task(&self, ctx: &StepContext) -> anyhow::Result<TaskRequest> {
        Ok(TaskRequest::new("shell", serde_json::to_vec(&ctx.inputs)?))
    }
}

/// Chain of `links` tasks; after the last one there is simply nothing left
pub struct CountingChain {
    pub links: u64,
}

#[async_trait]
impl TaskChainStep for CountingChain {
    async fn start_chain_link(
        &self,
        _ctx: &StepContext,
        pass_through: &Value,
        _previous: &ResponseMap,
    ) -> anyhow::Result<TaskChainLink> {
        let index = pass_through["index"].as_u64().unwrap_or(0);
        if index >= self.links {
            return Ok(TaskChainLink::done(pass_through.clone()));
        }
        Ok(TaskChainLink::task(
            TaskRequest::new("link", format!("link-{}", index)),
            json!({ "index": index + 1 }),
        ))
    }
}

pub fn registry() -> Arc<StepRegistry> {
    let registry = StepRegistry::new();
    registry.register_sync("ECHO", stagehand::step::PassThroughStep);
    registry.register_sync("FAIL", FailStep);
    registry.register_async("CALLBACK", CallbackStep);
    registry.register_task("SHELL", ParamsTask);
    registry.register_task_chain("CHAIN3", CountingChain { links: 3 });
    registry.register_child("WRAP", stagehand::step::DeclaredChildStep);
    registry.register_children("FORK", stagehand::step::DeclaredChildrenStep);
    registry.register_child_chain("SEQ", stagehand::step::DeclaredChildChainStep);
    Arc::new(registry)
}

pub fn node(id: &str, step: &str, mode: ExecutionMode) -> PlanNode {
    PlanNode::new(id, StepType::step(step), mode)
}

pub fn config() -> EngineConfig {
    EngineConfig {
        enable_recovery: false,
        ..EngineConfig::development()
    }
}

pub async fn engine_for(
    plan: Plan,
    store: Arc<MemoryStore>,
    tasks: Arc<ChannelTaskExecutor>,
) -> Arc<Engine> {
    Engine::builder()
        .config(config())
        .store(store)
        .steps(registry())
        .task_executor(tasks)
        .plan(plan)
        .build()
        .await
        .expect("engine builds")
}

/// Engine over a fresh memory store; dispatched tasks are dropped
pub async fn engine(plan: Plan) -> Arc<Engine> {
    let (tasks, _rx) = task_channel();
    engine_for(plan, Arc::new(MemoryStore::new()), tasks).await
}

pub async fn wait_for<F>(engine: &Engine, id: &str, what: &str, check: F) -> NodeExecution
where
    F: Fn(&NodeExecution) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(exec) = engine.get_execution(id).await.expect("store read") {
            if check(&exec) {
                return exec;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("node {} never became {}; last status {:?}", id, what, exec.status);
            }
        } else if tokio::time::Instant::now() > deadline {
            panic!("node {} never appeared", id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(engine: &Engine, id: &str, status: Status) -> NodeExecution {
    wait_for(engine, id, status.as_str(), |exec| exec.status == status).await
}

/// Wait until the node is terminal and its advice has run
pub async fn wait_for_concluded(engine: &Engine, id: &str) -> NodeExecution {
    wait_for(engine, id, "concluded", |exec| exec.concluded).await
}

/// Poll until `parent` has a child of plan node `node_id`
pub async fn wait_for_child(engine: &Engine, parent: &str, node_id: &str) -> NodeExecution {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let children = engine.children(parent).await.expect("store read");
        if let Some(child) = children.into_iter().find(|c| c.node.node_id == node_id) {
            return child;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "child {} of {} never appeared",
            node_id,
            parent
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
