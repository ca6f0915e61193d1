use std::sync::Arc;

use super::unexpected_response;
use crate::core::errors::Result;
use crate::engine::Engine;
use crate::model::{InvokerPackage, ResumePackage};
use crate::step::{StepContext, SyncStep};

/// Computes the result inline; never suspends
pub struct SyncStrategy {
    step: Arc<dyn SyncStep>,
}

impl SyncStrategy {
    pub fn new(step: Arc<dyn SyncStep>) -> Self {
        Self { step }
    }

    pub async fn start(&self, engine: &Engine, package: InvokerPackage) -> Result<()> {
        let ctx = StepContext::from_invoker(&package);
        let result = self.step.execute(&ctx).await;
        engine.conclude(&package.execution, result).await
    }

    pub async fn resume(&self, _engine: &Engine, package: ResumePackage) -> Result<()> {
        Err(unexpected_response(&package, "no"))
    }
}
