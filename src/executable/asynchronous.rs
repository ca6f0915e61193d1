use std::sync::Arc;

use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{ExecutableResponse, InvokerPackage, ResumePackage, Status};
use crate::step::{AsyncStep, StepContext};

/// Starts external work and waits on the callback ids it reports
pub struct AsyncStrategy {
    step: Arc<dyn AsyncStep>,
}

impl AsyncStrategy {
    pub fn new(step: Arc<dyn AsyncStep>) -> Self {
        Self { step }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        match self.step.execute_async(&ctx).await {
            Ok(callback_ids) => {
                engine
                    .suspend(
                        &package.execution,
                        Status::AsyncWaiting,
                        ExecutableResponse::Async { callback_ids },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => engine.conclude(&package.execution, Err(e)).await,
        }
    }

    pub async fn resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        let ctx = StepContext::from_resume(&package);
        let result = self
            .step
            .handle_async_response(&ctx, &package.responses)
            .await;
        engine.conclude(&package.execution, result).await
    }
}
