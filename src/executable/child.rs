use std::sync::Arc;

use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{ExecutableResponse, InvokerPackage, ResumePackage};
use crate::step::{decode_child_responses, ChildStep, StepContext};

/// Runs exactly one child and waits for it
pub struct ChildStrategy {
    step: Arc<dyn ChildStep>,
}

impl ChildStrategy {
    pub fn new(step: Arc<dyn ChildStep>) -> Self {
        Self { step }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        let child_node_id = match self.step.obtain_child(&ctx).await {
            Ok(id) => id,
            Err(e) => return engine.conclude(&package.execution, Err(e)).await,
        };

        let child = engine.prepare_child(&package.execution, &child_node_id)?;
        let response = ExecutableResponse::Child {
            child: engine.child_instance(&child),
        };
        engine
            .suspend_on_children(&package.execution, response, vec![child])
            .await?;
        Ok(())
    }

    pub async fn resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        let ctx = StepContext::from_resume(&package);
        let children = decode_child_responses(&package.responses);
        let result = self.step.handle_child_response(&ctx, &children).await;
        engine.conclude(&package.execution, result).await
    }
}
