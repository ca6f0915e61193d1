//! Executable strategies
//!
//! One strategy per execution mode, selected by `ExecutableProcessorFactory`
//! from the node's declared mode and its registered step handler. The
//! processor only exposes start and resume; all continuation state lives in
//! the persisted node execution, so a resume may run in another process.

pub mod accumulator;
mod asynchronous;
mod child;
mod child_chain;
mod children;
mod sync;
mod task;
mod task_chain;

pub use accumulator::ResponseAccumulator;
pub use asynchronous::AsyncStrategy;
pub use child::ChildStrategy;
pub use child_chain::ChildChainStrategy;
pub use children::ChildrenStrategy;
pub use sync::SyncStrategy;
pub use task::TaskStrategy;
pub use task_chain::TaskChainStrategy;

use tracing::debug;

use crate::core::errors::{EngineError, Result};
use crate::engine::Engine;
use crate::model::{
    merge_inputs, ExecutionMode, FailureInfo, FailureType, InvokerPackage, ResumePackage, Status,
    StepType,
};
use crate::step::{StepContext, StepHandler, StepRegistry, StepResponse};

impl StepContext {
    pub fn from_invoker(package: &InvokerPackage) -> Self {
        Self {
            ambiance: package.execution.ambiance.clone(),
            node_execution_id: package.execution.id.clone(),
            plan_node: package.plan_node.clone(),
            inputs: package.inputs.clone(),
        }
    }

    pub fn from_resume(package: &ResumePackage) -> Self {
        let params = &package.plan_node.step_parameters;
        let inputs = match &package.execution.resolved_input {
            Some(resolved) => merge_inputs(params, resolved),
            None => params.clone(),
        };
        Self {
            ambiance: package.execution.ambiance.clone(),
            node_execution_id: package.execution.id.clone(),
            plan_node: package.plan_node.clone(),
            inputs,
        }
    }
}

/// Strategy bound to one execution mode
pub enum Strategy {
    Sync(SyncStrategy),
    Async(AsyncStrategy),
    Child(ChildStrategy),
    Children(ChildrenStrategy),
    ChildChain(ChildChainStrategy),
    Task(TaskStrategy),
    TaskChain(TaskChainStrategy),
}

pub struct ExecutableProcessor {
    strategy: Strategy,
}

impl ExecutableProcessor {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub async fn handle_start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        match &self.strategy {
            Strategy::Sync(s) => s.start(engine, package).await,
            Strategy::Async(s) => s.start(engine, package).await,
            Strategy::Child(s) => s.start(engine, package).await,
            Strategy::Children(s) => s.start(engine, package).await,
            Strategy::ChildChain(s) => s.start(engine, package).await,
            Strategy::Task(s) => s.start(engine, package).await,
            Strategy::TaskChain(s) => s.start(engine, package).await,
        }
    }

    pub async fn handle_resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        if package.async_error {
            let message = package
                .responses
                .values()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect::<Vec<_>>()
                .join("; ");
            debug!(node_execution_id = %package.execution.id, "Resuming with delivery error");
            let response = StepResponse {
                status: Status::Failed,
                outcome: None,
                failure: Some(FailureInfo::new(FailureType::Delivery, message)),
            };
            return engine.finalize(&package.execution, response).await;
        }

        match &self.strategy {
            Strategy::Sync(s) => s.resume(engine, package).await,
            Strategy::Async(s) => s.resume(engine, package).await,
            Strategy::Child(s) => s.resume(engine, package).await,
            Strategy::Children(s) => s.resume(engine, package).await,
            Strategy::ChildChain(s) => s.resume(engine, package).await,
            Strategy::Task(s) => s.resume(engine, package).await,
            Strategy::TaskChain(s) => s.resume(engine, package).await,
        }
    }
}

/// Picks the strategy for a node's mode
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutableProcessorFactory;

impl ExecutableProcessorFactory {
    pub fn obtain(
        &self,
        mode: ExecutionMode,
        step_type: &StepType,
        registry: &StepRegistry,
    ) -> Result<ExecutableProcessor> {
        let handler = registry.resolve(step_type, mode)?;
        let strategy = match (mode, handler) {
            (ExecutionMode::Sync, StepHandler::Sync(step)) => Strategy::Sync(SyncStrategy::new(step)),
            (ExecutionMode::Async, StepHandler::Async(step)) => {
                Strategy::Async(AsyncStrategy::new(step))
            }
            (ExecutionMode::Child, StepHandler::Child(step)) => {
                Strategy::Child(ChildStrategy::new(step))
            }
            (ExecutionMode::Children, StepHandler::Children(step)) => {
                Strategy::Children(ChildrenStrategy::new(step))
            }
            (ExecutionMode::ChildChain, StepHandler::ChildChain(step)) => {
                Strategy::ChildChain(ChildChainStrategy::new(step))
            }
            (ExecutionMode::Task(protocol), StepHandler::Task(step)) => {
                Strategy::Task(TaskStrategy::new(step, protocol))
            }
            (ExecutionMode::TaskChain(protocol), StepHandler::TaskChain(step)) => {
                Strategy::TaskChain(TaskChainStrategy::new(step, protocol))
            }
            (mode, handler) => {
                return Err(EngineError::ModeMismatch {
                    step_type: step_type.name.clone(),
                    mode: mode.to_string(),
                    handler: handler.kind().to_string(),
                })
            }
        };
        Ok(ExecutableProcessor::new(strategy))
    }
}

/// Fail a resume whose last response does not belong to this strategy
pub(crate) fn unexpected_response(package: &ResumePackage, expected: &str) -> EngineError {
    EngineError::UnexpectedResponse {
        node_execution_id: package.execution.id.clone(),
        reason: format!(
            "expected {} response, found {}",
            expected,
            package
                .execution
                .last_response()
                .map(|r| r.kind())
                .unwrap_or("none")
        ),
    }
}
