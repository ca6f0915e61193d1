use std::sync::Arc;

use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{ExecutableResponse, InvokerPackage, ResumePackage, TaskProtocol};
use crate::step::{StepContext, TaskStep};

/// Delegates one unit of work to the task executor
pub struct TaskStrategy {
    step: Arc<dyn TaskStep>,
    protocol: TaskProtocol,
}

impl TaskStrategy {
    pub fn new(step: Arc<dyn TaskStep>, protocol: TaskProtocol) -> Self {
        Self { step, protocol }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        let request = match self.step.obtain_task(&ctx).await {
            Ok(request) => request,
            Err(e) => return engine.conclude(&package.execution, Err(e)).await,
        };

        let correlation_id = engine.new_correlation_id();
        let response = ExecutableResponse::Task {
            correlation_id: correlation_id.clone(),
            task_type: request.task_type.clone(),
            protocol: self.protocol,
        };
        engine
            .suspend_on_task(&package.execution, response, correlation_id, request, self.protocol)
            .await?;
        Ok(())
    }

    pub async fn resume(&self, engine: &Engine, package: ResumePackage) -> Result<()> {
        let ctx = StepContext::from_resume(&package);
        let result = self.step.handle_task_result(&ctx, &package.responses).await;
        engine.conclude(&package.execution, result).await
    }
}
