use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::unexpected_response;
use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{
    ExecutableResponse, InvokerPackage, NodeExecution, ResponseMap, ResumePackage, TaskProtocol,
    TaskResult,
};
use crate::step::{StepContext, TaskChainLink, TaskChainStep};

/// Repeats dispatch/resume cycles until the chain is done.
///
/// Running out of links is a normal end: the chain finalizes with the last
/// link's result. A link whose task did not succeed ends the chain early.
pub struct TaskChainStrategy {
    step: Arc<dyn TaskChainStep>,
    protocol: TaskProtocol,
}

impl TaskChainStrategy {
    pub fn new(step: Arc<dyn TaskChainStep>, protocol: TaskProtocol) -> Self {
        Self { step, protocol }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        let previous = ResponseMap::new();
        match self.step.start_chain_link(&ctx, &Value::Null, &previous).await {
            Ok(link) => {
                self.follow(engine, &ctx, &package.execution, link, &previous)
                    .await
            }
            Err(e) => engine.conclude(&package.execution, Err(e)).await,
        }
    }

    pub async fn resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        let Some(ExecutableResponse::TaskChain {
            pass_through,
            chain_end,
            ..
        }) = package.execution.last_response().cloned()
        else {
            return Err(unexpected_response(&package, "TASK_CHAIN"));
        };

        let ctx = StepContext::from_resume(&package);
        if chain_end || link_failed(&package.responses) {
            let result = self
                .step
                .finalize_execution(&ctx, &pass_through, &package.responses)
                .await;
            return engine.conclude(&package.execution, result).await;
        }

        match self
            .step
            .start_chain_link(&ctx, &pass_through, &package.responses)
            .await
        {
            Ok(link) => {
                self.follow(engine, &ctx, &package.execution, link, &package.responses)
                    .await
            }
            Err(e) => engine.conclude(&package.execution, Err(e)).await,
        }
    }

    async fn follow(
        &self,
        engine: &Engine,
        ctx: &StepContext,
        execution: &NodeExecution,
        link: TaskChainLink,
        previous: &ResponseMap,
    ) -> Result<()> {
        let Some(task) = link.task else {
            debug!(node_execution_id = %execution.id, "Task chain has no further links");
            let result = self
                .step
                .finalize_execution(ctx, &link.pass_through, previous)
                .await;
            return engine.conclude(execution, result).await;
        };

        let correlation_id = engine.new_correlation_id();
        let response = ExecutableResponse::TaskChain {
            correlation_id: Some(correlation_id.clone()),
            task_type: Some(task.task_type.clone()),
            protocol: self.protocol,
            pass_through: link.pass_through,
            chain_end: link.chain_end,
        };
        engine
            .suspend_on_task(execution, response, correlation_id, task, self.protocol)
            .await?;
        Ok(())
    }
}

fn link_failed(responses: &ResponseMap) -> bool {
    responses.values().any(|raw| {
        TaskResult::from_bytes(raw)
            .map(|result| !result.status.is_positive())
            .unwrap_or(true)
    })
}
