//! Broker and timeout callbacks
//!
//! Callbacks carry ids only. Everything needed to continue is reloaded from
//! the store when they fire.

use async_trait::async_trait;
use std::sync::Weak;
use tracing::{debug, error, warn};

use super::{Engine, EngineJob};
use crate::broker::NotifyCallback;
use crate::model::ResponseMap;
use crate::timeout::TimeoutCallback;

/// Resumes a suspended node once its wait completes
pub struct EngineResumeCallback {
    pub(crate) engine: Weak<Engine>,
    pub(crate) node_execution_id: String,
}

impl EngineResumeCallback {
    fn submit(&self, responses: ResponseMap, async_error: bool) {
        let Some(engine) = self.engine.upgrade() else {
            debug!(node_execution_id = %self.node_execution_id, "Engine gone, dropping resume");
            return;
        };
        engine.metrics().record_callback();
        engine.submit(EngineJob::Resume {
            node_execution_id: self.node_execution_id.clone(),
            responses,
            async_error,
        });
    }
}

#[async_trait]
impl NotifyCallback for EngineResumeCallback {
    async fn notify(&self, responses: ResponseMap) {
        self.submit(responses, false);
    }

    async fn notify_error(&self, responses: ResponseMap) {
        warn!(node_execution_id = %self.node_execution_id, "Wait completed with error");
        self.submit(responses, true);
    }

    async fn notify_timeout(&self, _responses: ResponseMap) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.submit(EngineJob::Expire {
            node_execution_id: self.node_execution_id.clone(),
        });
    }
}

/// Continues a node parked on execution input
pub struct ExecutionInputCallback {
    pub(crate) engine: Weak<Engine>,
    pub(crate) node_execution_id: String,
    pub(crate) instance_id: String,
}

#[async_trait]
impl NotifyCallback for ExecutionInputCallback {
    async fn notify(&self, responses: ResponseMap) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.metrics().record_callback();
        let merged = match responses.get(&self.instance_id) {
            Some(raw) => match serde_json::from_slice(raw) {
                Ok(value) => value,
                Err(e) => {
                    error!(instance_id = %self.instance_id, error = %e, "Undecodable execution input");
                    return;
                }
            },
            None => {
                error!(instance_id = %self.instance_id, "Execution input callback without payload");
                return;
            }
        };
        match engine
            .resume_after_input(&self.node_execution_id, merged)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(
                node_execution_id = %self.node_execution_id,
                "Execution input arrived for a node no longer waiting"
            ),
            Err(e) => error!(
                node_execution_id = %self.node_execution_id,
                error = %e,
                "Failed to continue after execution input"
            ),
        }
    }

    async fn notify_error(&self, _responses: ResponseMap) {
        // No automatic retry; the node stays INPUT_WAITING
        error!(
            node_execution_id = %self.node_execution_id,
            instance_id = %self.instance_id,
            "Execution input wait errored"
        );
    }

    async fn notify_timeout(&self, _responses: ResponseMap) {
        debug!(
            node_execution_id = %self.node_execution_id,
            instance_id = %self.instance_id,
            "Execution input wait elapsed"
        );
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(e) = engine.input_gate().on_wait_elapsed(&self.instance_id).await {
            error!(instance_id = %self.instance_id, error = %e, "Failed to expire execution input");
        }
    }
}

/// Expires a node when its armed timeout fires
pub struct EngineTimeoutCallback {
    pub(crate) engine: Weak<Engine>,
}

#[async_trait]
impl TimeoutCallback for EngineTimeoutCallback {
    async fn on_timeout(&self, node_execution_id: String, timeout_instance_id: String) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        debug!(node_execution_id = %node_execution_id, timeout_instance_id = %timeout_instance_id, "Node timeout elapsed");
        engine.submit(EngineJob::Expire { node_execution_id });
    }
}
