//! Stagehand: node execution engine for compiled pipeline plans
//!
//! Each node of a plan runs under one execution mode (sync, async, child,
//! children, child chain, task, task chain). A node either finishes inline
//! or suspends on wait keys held by the notification broker and is resumed
//! later, possibly by another process, from state persisted in the store.

// Core infrastructure modules
pub mod core;

// Data model and persistence
pub mod model;
pub mod storage;

// Collaborators
pub mod broker;
pub mod task;
pub mod timeout;

// Execution
pub mod engine;
pub mod executable;
pub mod input;
pub mod recovery;
pub mod step;

// Re-exports for convenience
pub use crate::core::{EngineConfig, EngineConfigBuilder, EngineError, EngineMetrics, Result};
pub use broker::{NotifyBroker, NotifyCallback};
pub use engine::events::{EngineEvent, EngineEventEnvelope};
pub use engine::{Engine, EngineBuilder, EngineJob};
pub use input::ExecutionInputGate;
pub use model::{
    Ambiance, ChildInstance, ExecutableResponse, ExecutionInputInstance, ExecutionMode,
    FailureInfo, FailureType, InputState, NodeExecution, NodeUpdate, Plan, PlanNode, ResponseMap,
    RetryPolicy, Status, StepNotifyData, StepType, TaskProtocol, TaskResult,
};
pub use recovery::{Recovery, RecoveryStats};
pub use step::{
    AsyncStep, ChildChainLink, ChildChainStep, ChildResponses, ChildStep, ChildrenStep,
    StepContext, StepHandler, StepRegistry, StepResponse, SyncStep, TaskChainLink, TaskChainStep,
    TaskRequest, TaskStep,
};
pub use storage::{ExecutionInputStore, MemoryStore, NodeExecutionStore, SledStore};
pub use task::{TaskDispatch, TaskExecutor};
pub use timeout::{TimeoutEngine, TokioTimeoutEngine};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
