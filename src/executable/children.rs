use std::sync::Arc;
use tracing::debug;

use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{ExecutableResponse, InvokerPackage, ResumePackage};
use crate::step::{decode_child_responses, ChildrenStep, StepContext};

/// Runs every child in parallel and resumes once all of them reported
pub struct ChildrenStrategy {
    step: Arc<dyn ChildrenStep>,
}

impl ChildrenStrategy {
    pub fn new(step: Arc<dyn ChildrenStep>) -> Self {
        Self { step }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        let child_node_ids = match self.step.obtain_children(&ctx).await {
            Ok(ids) => ids,
            Err(e) => return engine.conclude(&package.execution, Err(e)).await,
        };

        let mut children = Vec::with_capacity(child_node_ids.len());
        for node_id in &child_node_ids {
            children.push(engine.prepare_child(&package.execution, node_id)?);
        }
        debug!(
            node_execution_id = %package.execution.id,
            children = children.len(),
            "Fanning out"
        );
        let response = ExecutableResponse::Children {
            children: children.iter().map(|c| engine.child_instance(c)).collect(),
        };
        engine
            .suspend_on_children(&package.execution, response, children)
            .await?;
        Ok(())
    }

    pub async fn resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        let ctx = StepContext::from_resume(&package);
        let children = decode_child_responses(&package.responses);
        let result = self.step.handle_children_response(&ctx, &children).await;
        engine.conclude(&package.execution, result).await
    }
}
