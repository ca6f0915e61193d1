use std::sync::Arc;
use tracing::debug;

use super::unexpected_response;
use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{ExecutableResponse, InvokerPackage, NodeExecution, ResumePackage, Status};
use crate::step::{decode_child_responses, ChildChainLink, ChildChainStep, StepContext};

/// Runs children one after another; each report decides whether the chain goes on.
///
/// A link with `suspend` set ends the chain right away: nothing more is
/// started and the node resumes immediately, even if the plan has more links.
pub struct ChildChainStrategy {
    step: Arc<dyn ChildChainStep>,
}

impl ChildChainStrategy {
    pub fn new(step: Arc<dyn ChildChainStep>) -> Self {
        Self { step }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        match self.step.execute_first_child(&ctx).await {
            Ok(link) => self.follow(engine, &package.execution, link).await,
            Err(e) => engine.conclude(&package.execution, Err(e)).await,
        }
    }

    pub async fn resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        let Some(ExecutableResponse::ChildChain {
            pass_through,
            last_link,
            suspend,
            ..
        }) = package.execution.last_response().cloned()
        else {
            return Err(unexpected_response(&package, "CHILD_CHAIN"));
        };

        let ctx = StepContext::from_resume(&package);
        let children = decode_child_responses(&package.responses);
        if suspend || last_link {
            let result = self
                .step
                .finalize_execution(&ctx, &pass_through, &children)
                .await;
            return engine.conclude(&package.execution, result).await;
        }

        match self
            .step
            .execute_next_child(&ctx, &pass_through, &children)
            .await
        {
            Ok(link) => self.follow(engine, &package.execution, link).await,
            Err(e) => engine.conclude(&package.execution, Err(e)).await,
        }
    }

    async fn follow(&self, engine: &Engine, execution: &NodeExecution, link: ChildChainLink) -> Result<()> {
        match link.child_node_id {
            Some(child_node_id) if !link.suspend => {
                let child = engine.prepare_child(execution, &child_node_id)?;
                let response = ExecutableResponse::ChildChain {
                    child: Some(engine.child_instance(&child)),
                    pass_through: link.pass_through,
                    last_link: link.last_link,
                    suspend: false,
                };
                engine
                    .suspend_on_children(execution, response, vec![child])
                    .await?;
            }
            _ => {
                debug!(node_execution_id = %execution.id, "Child chain suspended, resuming without dispatch");
                let response = ExecutableResponse::ChildChain {
                    child: None,
                    pass_through: link.pass_through,
                    last_link: link.last_link,
                    suspend: true,
                };
                engine.suspend(execution, Status::Running, response).await?;
            }
        }
        Ok(())
    }
}
