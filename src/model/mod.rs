// Engine data model: plan graph, node executions and transient packages

pub mod ambiance;
pub mod execution;
pub mod input;
pub mod notify;
pub mod packages;
pub mod plan;
pub mod status;

pub use ambiance::{Ambiance, Level};
pub use execution::{
    ChildInstance, ExecutableResponse, FailureInfo, FailureType, NodeExecution, NodeUpdate,
    PlanNodeRef,
};
pub use input::{ExecutionInputInstance, InputState};
pub use notify::{ResponseMap, StepNotifyData, TaskResult};
pub use packages::{merge_inputs, InvokerPackage, ResumePackage};
pub use plan::{
    AdviserPolicy, ExecutionMode, Plan, PlanNode, RetryPolicy, StepCategory, StepType,
    TaskProtocol,
};
pub use status::Status;
