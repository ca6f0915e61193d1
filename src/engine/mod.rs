//! Node execution engine
//!
//! Owns the worker pool and ties the collaborators together: strategies call
//! back into the engine to suspend, spawn children or conclude; broker and
//! timeout callbacks come back in as `EngineJob`s. Every job begins with a
//! status compare-and-set, so a node never runs two jobs at once and late or
//! duplicate deliveries fall through without side effects.

pub mod advise;
pub mod callbacks;
pub mod events;

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::broker::NotifyBroker;
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::core::metrics::EngineMetrics;
use crate::executable::{ExecutableProcessor, ExecutableProcessorFactory, ResponseAccumulator};
use crate::input::ExecutionInputGate;
use crate::model::{
    Ambiance, ChildInstance, ExecutableResponse, FailureInfo, FailureType, InvokerPackage, Level,
    NodeExecution, NodeUpdate, Plan, PlanNode, PlanNodeRef, ResponseMap, ResumePackage, Status,
    StepNotifyData, TaskProtocol, TaskResult,
};
use crate::recovery::{Recovery, RecoveryStats};
use crate::step::{StepRegistry, StepResponse, TaskRequest};
use crate::storage::{ExecutionInputStore, MemoryStore, NodeExecutionStore, SledStore};
use crate::task::{TaskDispatch, TaskExecutor, UnconfiguredTaskExecutor};
use crate::timeout::{TimeoutEngine, TimeoutTracker, TokioTimeoutEngine};

use advise::{advise, Advice};
use callbacks::{EngineResumeCallback, EngineTimeoutCallback};
use events::{EngineEvent, EngineEventEnvelope, EventBus};

/// Unit of work run on the worker pool
#[derive(Debug, Clone)]
pub enum EngineJob {
    Start {
        node_execution_id: String,
    },
    Resume {
        node_execution_id: String,
        responses: ResponseMap,
        async_error: bool,
    },
    Expire {
        node_execution_id: String,
    },
}

impl EngineJob {
    fn node_execution_id(&self) -> &str {
        match self {
            EngineJob::Start { node_execution_id }
            | EngineJob::Resume {
                node_execution_id, ..
            }
            | EngineJob::Expire { node_execution_id } => node_execution_id,
        }
    }
}

pub struct Engine {
    weak_self: Weak<Engine>,
    config: EngineConfig,
    plans: DashMap<String, Arc<Plan>>,
    nodes: Arc<dyn NodeExecutionStore>,
    inputs: Arc<dyn ExecutionInputStore>,
    broker: NotifyBroker,
    timeouts: Arc<dyn TimeoutEngine>,
    tracker: TimeoutTracker,
    tasks: Arc<dyn TaskExecutor>,
    steps: Arc<StepRegistry>,
    factory: ExecutableProcessorFactory,
    accumulator: ResponseAccumulator,
    gate: ExecutionInputGate,
    events: Arc<EventBus>,
    metrics: Arc<EngineMetrics>,
    workers: Arc<Semaphore>,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Register a compiled plan; malformed plans are rejected
    pub fn register_plan(&self, plan: Plan) -> Result<()> {
        plan.validate()?;
        info!(plan_id = %plan.id, nodes = plan.nodes.len(), "Registered plan");
        self.plans.insert(plan.id.clone(), Arc::new(plan));
        Ok(())
    }

    pub fn plan(&self, plan_id: &str) -> Result<Arc<Plan>> {
        self.plans
            .get(plan_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| EngineError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })
    }

    fn plan_node(&self, node: &PlanNodeRef) -> Result<PlanNode> {
        Ok(self.plan(&node.plan_id)?.node(&node.node_id)?.clone())
    }

    /// Create and queue the root node of a plan; returns its execution id
    pub async fn start_plan(&self, plan_id: &str, ambiance: Ambiance) -> Result<String> {
        let plan = self.plan(plan_id)?;
        let root = plan.node(&plan.start_node_id)?;
        let id = new_id();
        let mut ambiance = ambiance;
        ambiance.plan_id = plan.id.clone();
        let ambiance = ambiance.child(level_for(root, &id));

        let execution = NodeExecution::queued(id.clone(), ambiance, &plan.id, root, None, None);
        self.nodes.save(&execution).await?;
        info!(
            plan_id = %plan.id,
            plan_execution_id = %execution.ambiance.plan_execution_id,
            node_execution_id = %id,
            "Starting plan execution"
        );
        self.events.publish(EngineEvent::status_changed(&execution));
        self.submit(EngineJob::Start {
            node_execution_id: id.clone(),
        });
        Ok(id)
    }

    /// Queue a job on the worker pool
    pub(crate) fn submit(&self, job: EngineJob) {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(node_execution_id = %job.node_execution_id(), "Engine shutting down, job dropped");
            return;
        }
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let id = job.node_execution_id().to_string();
            if let Err(e) = engine.run_job(job).await {
                error!(node_execution_id = %id, error = %e, "Engine job failed");
            }
        });
    }

    fn submit_after(&self, job: EngineJob, wait: Duration) {
        if wait.is_zero() {
            self.submit(job);
            return;
        }
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(engine) = weak.upgrade() {
                engine.submit(job);
            }
        });
    }

    async fn run_job(&self, job: EngineJob) -> Result<()> {
        match job {
            EngineJob::Start { node_execution_id } => self.start_node(&node_execution_id).await,
            EngineJob::Resume {
                node_execution_id,
                responses,
                async_error,
            } => {
                self.resume_node(&node_execution_id, responses, async_error)
                    .await
            }
            EngineJob::Expire { node_execution_id } => {
                self.expire_node(&node_execution_id).await.map(|_| ())
            }
        }
    }

    /// Start a QUEUED node: input gate, RUNNING, timeout, then the strategy
    pub async fn start_node(&self, id: &str) -> Result<()> {
        let execution = self.nodes.get_required(id).await?;
        if execution.status != Status::Queued {
            debug!(node_execution_id = %id, status = %execution.status.as_str(), "Start skipped, node not queued");
            self.metrics.record_rejected_resume();
            return Ok(());
        }

        let plan_node = match self.plan_node(&execution.node) {
            Ok(node) => node,
            Err(e) => return self.fail_processing(id, e).await,
        };
        if let Some(template) = &plan_node.execution_input_template {
            if execution.resolved_input.is_none() {
                self.gate
                    .wait_for_execution_input(&execution, template)
                    .await?;
                return Ok(());
            }
        }
        let processor = match self.processor_for(&plan_node) {
            Ok(processor) => processor,
            Err(e) => return self.fail_processing(id, e).await,
        };

        let Some(running) = self
            .nodes
            .update_status(id, &[Status::Queued], Status::Running)
            .await?
        else {
            debug!(node_execution_id = %id, "Lost the race to start node");
            self.metrics.record_rejected_resume();
            return Ok(());
        };
        self.metrics.record_started();
        self.events.publish(EngineEvent::status_changed(&running));
        debug!(
            node_execution_id = %id,
            node_id = %running.node.node_id,
            mode = %running.mode(),
            "Node started"
        );

        let running = self.arm_timeout(running, &plan_node).await?;
        let package = InvokerPackage::new(running, plan_node);
        if let Err(e) = processor.handle_start(self, package).await {
            return self.fail_processing(id, e).await;
        }
        Ok(())
    }

    /// Resume a suspended node with the responses its wait collected
    pub async fn resume_node(
        &self,
        id: &str,
        responses: ResponseMap,
        async_error: bool,
    ) -> Result<()> {
        let Some(execution) = self
            .nodes
            .update_status(id, &Status::RESUMABLE, Status::Running)
            .await?
        else {
            debug!(node_execution_id = %id, "Resume rejected, node not waiting");
            self.metrics.record_rejected_resume();
            return Ok(());
        };
        self.metrics.record_resumed();

        let plan_node = match self.plan_node(&execution.node) {
            Ok(node) => node,
            Err(e) => return self.fail_processing(id, e).await,
        };
        let processor = match self.processor_for(&plan_node) {
            Ok(processor) => processor,
            Err(e) => return self.fail_processing(id, e).await,
        };

        let responses = if async_error {
            responses
        } else {
            match self.accumulator.build_response_map(&execution, responses).await {
                Ok(responses) => responses,
                Err(e) => return self.fail_processing(id, e).await,
            }
        };
        debug!(node_execution_id = %id, responses = responses.len(), async_error, "Node resumed");

        let mut package = ResumePackage::new(execution, plan_node, responses);
        package.async_error = async_error;
        if let Err(e) = processor.handle_resume(self, package).await {
            return self.fail_processing(id, e).await;
        }
        Ok(())
    }

    /// Continue a node after its execution input was supplied.
    ///
    /// Only a node that is exactly INPUT_WAITING moves back to QUEUED; anything
    /// else is a duplicate or late delivery and is rejected without effect.
    pub async fn resume_after_input(&self, id: &str, merged: serde_json::Value) -> Result<bool> {
        let Some(queued) = self
            .nodes
            .update_status_with_ops(
                id,
                &[Status::InputWaiting],
                Status::Queued,
                vec![NodeUpdate::SetResolvedInput(merged)],
            )
            .await?
        else {
            self.metrics.record_rejected_resume();
            return Ok(false);
        };
        info!(node_execution_id = %id, "Execution input received, re-queueing node");
        self.events.publish(EngineEvent::status_changed(&queued));
        self.submit(EngineJob::Start {
            node_execution_id: id.to_string(),
        });
        Ok(true)
    }

    fn processor_for(&self, plan_node: &PlanNode) -> Result<ExecutableProcessor> {
        self.factory
            .obtain(plan_node.mode, &plan_node.step_type, &self.steps)
    }

    async fn arm_timeout(&self, running: NodeExecution, plan_node: &PlanNode) -> Result<NodeExecution> {
        let Some(after) = plan_node.timeout.or(self.config.default_node_timeout) else {
            return Ok(running);
        };
        let callback = Arc::new(EngineTimeoutCallback {
            engine: self.weak_self.clone(),
        });
        let instance_id = self.timeouts.register(&running.id, after, callback).await?;
        match self
            .nodes
            .apply(
                &running.id,
                vec![NodeUpdate::AddTimeoutInstances(vec![instance_id.clone()])],
            )
            .await
        {
            Ok(updated) => {
                debug!(node_execution_id = %running.id, timeout_instance_id = %instance_id, ?after, "Armed node timeout");
                Ok(updated)
            }
            Err(e) => {
                self.timeouts.delete(&[instance_id]).await?;
                Err(e)
            }
        }
    }

    /// Finish a node from a step result; a step error is a business failure
    pub(crate) async fn conclude(
        &self,
        execution: &NodeExecution,
        result: anyhow::Result<StepResponse>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(node_execution_id = %execution.id, error = %e, "Step failed");
                StepResponse::failed(format!("{:#}", e))
            }
        };
        self.finalize(execution, response).await
    }

    /// Move a RUNNING node to the response's terminal status and run advice
    pub(crate) async fn finalize(&self, execution: &NodeExecution, response: StepResponse) -> Result<()> {
        if !response.status.is_terminal() {
            return Err(EngineError::IllegalTransition {
                node_execution_id: execution.id.clone(),
                from: execution.status,
                to: response.status,
            });
        }
        let mut ops = Vec::new();
        if let Some(outcome) = response.outcome {
            ops.push(NodeUpdate::SetOutcome(outcome));
        }
        if let Some(failure) = response.failure {
            ops.push(NodeUpdate::SetFailure(failure));
        }
        let Some(terminal) = self
            .nodes
            .update_status_with_ops(&execution.id, &[Status::Running], response.status, ops)
            .await?
        else {
            debug!(node_execution_id = %execution.id, "Node left RUNNING before it could finish");
            self.metrics.record_rejected_resume();
            return Ok(());
        };
        self.on_terminal(terminal, true).await
    }

    /// Persist a suspension and bind its wait keys to a resume.
    ///
    /// Returns the broker wait id, or `None` when the node was no longer
    /// RUNNING. A response without wait keys resumes at once.
    pub(crate) async fn suspend(
        &self,
        execution: &NodeExecution,
        status: Status,
        response: ExecutableResponse,
    ) -> Result<Option<String>> {
        let keys = response.wait_keys();
        let Some(suspended) = self
            .nodes
            .update_status_with_ops(
                &execution.id,
                &[Status::Running],
                status,
                vec![NodeUpdate::AppendResponse(response)],
            )
            .await?
        else {
            debug!(node_execution_id = %execution.id, "Suspend skipped, node not running");
            return Ok(None);
        };
        if status != Status::Running {
            self.events.publish(EngineEvent::status_changed(&suspended));
        }
        debug!(
            node_execution_id = %execution.id,
            status = %status.as_str(),
            wait_keys = keys.len(),
            "Node suspended"
        );
        let wait_id = self.register_resume(&suspended.id, keys)?;
        Ok(Some(wait_id))
    }

    pub(crate) fn register_resume(&self, id: &str, keys: Vec<String>) -> Result<String> {
        let callback = Arc::new(EngineResumeCallback {
            engine: self.weak_self.clone(),
            node_execution_id: id.to_string(),
        });
        self.broker.register_wait(keys, callback, None)
    }

    /// Build (but do not save) a child run of `child_node_id` under `parent`
    pub(crate) fn prepare_child(&self, parent: &NodeExecution, child_node_id: &str) -> Result<NodeExecution> {
        let plan = self.plan(&parent.node.plan_id)?;
        let node = plan.node(child_node_id)?;
        let id = new_id();
        let ambiance = parent.ambiance.child(level_for(node, &id));
        Ok(NodeExecution::queued(
            id.clone(),
            ambiance,
            &plan.id,
            node,
            Some(parent.id.clone()),
            Some(id),
        ))
    }

    pub(crate) fn child_instance(&self, child: &NodeExecution) -> ChildInstance {
        ChildInstance {
            node_id: child.node.node_id.clone(),
            execution_id: child.id.clone(),
        }
    }

    /// Save children, suspend the parent on them, then start them.
    ///
    /// If the parent can no longer suspend the children are skipped instead.
    pub(crate) async fn suspend_on_children(
        &self,
        parent: &NodeExecution,
        response: ExecutableResponse,
        children: Vec<NodeExecution>,
    ) -> Result<bool> {
        futures::future::try_join_all(children.iter().map(|child| self.nodes.save(child))).await?;
        if self
            .suspend(parent, Status::Running, response)
            .await?
            .is_some()
        {
            for child in children {
                self.events.publish(EngineEvent::status_changed(&child));
                self.submit(EngineJob::Start {
                    node_execution_id: child.id,
                });
            }
            return Ok(true);
        }
        // Skipped children never run, so nothing is left for advice to do
        for child in &children {
            if let Some(skipped) = self
                .nodes
                .update_status_with_ops(
                    &child.id,
                    &[Status::Queued],
                    Status::Skipped,
                    vec![NodeUpdate::MarkConcluded],
                )
                .await?
            {
                self.events.publish(EngineEvent::status_changed(&skipped));
            }
        }
        Ok(false)
    }

    /// Suspend on a task and hand it to the executor.
    ///
    /// The wait is registered before dispatch so a fast executor cannot
    /// report into an unbound key. A failed dispatch cancels the wait.
    pub(crate) async fn suspend_on_task(
        &self,
        execution: &NodeExecution,
        response: ExecutableResponse,
        correlation_id: String,
        request: TaskRequest,
        protocol: TaskProtocol,
    ) -> Result<bool> {
        let Some(wait_id) = self
            .suspend(execution, Status::TaskWaiting, response)
            .await?
        else {
            return Ok(false);
        };
        let dispatch = TaskDispatch {
            correlation_id: correlation_id.clone(),
            node_execution_id: execution.id.clone(),
            task_type: request.task_type,
            protocol,
            payload: request.payload,
            ambiance: execution.ambiance.clone(),
        };
        if let Err(e) = self.tasks.dispatch(dispatch).await {
            self.broker.cancel(&wait_id);
            return Err(e);
        }
        debug!(node_execution_id = %execution.id, correlation_id = %correlation_id, "Task dispatched");
        Ok(true)
    }

    pub(crate) fn new_correlation_id(&self) -> String {
        new_id()
    }

    /// Common tail of every terminal transition: metrics, event, timeout
    /// cleanup and (optionally) advice
    async fn on_terminal(&self, execution: NodeExecution, advise: bool) -> Result<()> {
        self.metrics.record_terminal();
        info!(
            node_execution_id = %execution.id,
            node_id = %execution.node.node_id,
            status = %execution.status.as_str(),
            "Node execution finished"
        );
        self.events.publish(EngineEvent::status_changed(&execution));
        self.tracker.on_terminal(&execution).await;
        self.release_waits(&execution).await;
        if advise {
            self.conclude_with_advice(&execution).await
        } else {
            self.nodes
                .apply(&execution.id, vec![NodeUpdate::MarkConcluded])
                .await?;
            Ok(())
        }
    }

    /// Drop broker waits and open input instances a terminal node no longer needs.
    ///
    /// Keys come from the last persisted response; a wait that already fired
    /// has released them, so this only touches nodes aborted or expired while
    /// suspended.
    async fn release_waits(&self, execution: &NodeExecution) {
        if let Some(response) = execution.last_response() {
            let released = self.broker.cancel_keys(&response.wait_keys());
            if released > 0 {
                debug!(node_execution_id = %execution.id, released, "Released broker waits");
            }
        }

        let gated = self
            .plan_node(&execution.node)
            .map_or(false, |node| node.execution_input_template.is_some());
        if !gated {
            return;
        }
        match self.inputs.fetch_waiting_inputs_for_node(&execution.id).await {
            Ok(instances) => {
                for instance in instances {
                    self.broker.cancel_keys(&[instance.instance_id.clone()]);
                    if let Err(e) = self.gate.expire_instance(&instance.instance_id).await {
                        warn!(instance_id = %instance.instance_id, error = %e, "Failed to expire input instance");
                    }
                }
            }
            Err(e) => {
                warn!(node_execution_id = %execution.id, error = %e, "Failed to load input instances")
            }
        }
    }

    /// Carry out the advice for a terminal node and mark it concluded
    pub(crate) async fn conclude_with_advice(&self, execution: &NodeExecution) -> Result<()> {
        let plan_node = self.plan_node(&execution.node)?;
        let advice = advise(execution, &plan_node, self.config.default_retry_wait);
        debug!(node_execution_id = %execution.id, ?advice, "Advice computed");

        let mut ops = match advice {
            Advice::Retry { wait } => self.retry(execution, &plan_node, wait).await?,
            Advice::NextNode { node_id } => {
                self.start_next(execution, &node_id).await?;
                Vec::new()
            }
            Advice::End => {
                self.end(execution)?;
                Vec::new()
            }
        };
        ops.push(NodeUpdate::MarkConcluded);
        self.nodes.apply(&execution.id, ops).await?;
        Ok(())
    }

    async fn retry(
        &self,
        execution: &NodeExecution,
        plan_node: &PlanNode,
        wait: Duration,
    ) -> Result<Vec<NodeUpdate>> {
        let id = new_id();
        let mut ambiance = execution.ambiance.clone();
        if let Some(level) = ambiance.levels.last_mut() {
            level.runtime_id = id.clone();
        }
        let mut retry = NodeExecution::queued(
            id.clone(),
            ambiance,
            &execution.node.plan_id,
            plan_node,
            execution.parent_id.clone(),
            execution.notify_id.clone(),
        );
        retry.previous_id = execution.previous_id.clone();
        retry.retry_count = execution.retry_count + 1;
        retry.retried_from = Some(execution.id.clone());
        self.nodes.save(&retry).await?;

        info!(
            node_execution_id = %execution.id,
            retry_id = %id,
            attempt = retry.retry_count,
            ?wait,
            "Retrying node"
        );
        self.events.publish(EngineEvent::status_changed(&retry));
        self.submit_after(EngineJob::Start { node_execution_id: id.clone() }, wait);
        Ok(vec![NodeUpdate::MarkOldRetry, NodeUpdate::AddRetryId(id)])
    }

    async fn start_next(&self, execution: &NodeExecution, next_node_id: &str) -> Result<()> {
        let plan = self.plan(&execution.node.plan_id)?;
        let next = plan.node(next_node_id)?;
        let id = new_id();
        let mut ambiance = execution.ambiance.clone();
        ambiance.levels.pop();
        let ambiance = ambiance.child(level_for(next, &id));

        let mut sibling = NodeExecution::queued(
            id.clone(),
            ambiance,
            &plan.id,
            next,
            execution.parent_id.clone(),
            execution.notify_id.clone(),
        );
        sibling.previous_id = Some(execution.id.clone());
        self.nodes.save(&sibling).await?;
        debug!(node_execution_id = %execution.id, next_id = %id, next_node_id, "Starting next node");
        self.events.publish(EngineEvent::status_changed(&sibling));
        self.submit(EngineJob::Start {
            node_execution_id: id,
        });
        Ok(())
    }

    /// Report to the parent, or complete the plan execution for a root node
    fn end(&self, execution: &NodeExecution) -> Result<()> {
        if execution.parent_id.is_some() {
            let key = execution
                .notify_id
                .clone()
                .unwrap_or_else(|| execution.id.clone());
            let data = StepNotifyData::from_execution(execution).to_bytes()?;
            debug!(node_execution_id = %execution.id, notify_id = %key, "Notifying parent");
            return self.broker.fulfilled(&key, data);
        }
        info!(
            plan_execution_id = %execution.ambiance.plan_execution_id,
            status = %execution.status.as_str(),
            "Plan execution completed"
        );
        self.events.publish(EngineEvent::PlanCompleted {
            plan_execution_id: execution.ambiance.plan_execution_id.clone(),
            node_execution_id: execution.id.clone(),
            status: execution.status,
        });
        Ok(())
    }

    /// Expire a node whose timeout elapsed; `false` if it had already finished
    pub async fn expire_node(&self, id: &str) -> Result<bool> {
        let failure = FailureInfo::new(FailureType::Timeout, "node execution timed out");
        let Some(expired) = self
            .nodes
            .update_status_with_ops(
                id,
                &Status::non_final(),
                Status::Expired,
                vec![NodeUpdate::SetFailure(failure)],
            )
            .await?
        else {
            debug!(node_execution_id = %id, "Timeout for finished node ignored");
            return Ok(false);
        };
        warn!(node_execution_id = %id, "Node execution expired");
        self.on_terminal(expired, true).await?;
        Ok(true)
    }

    /// Abort a non-terminal node. Its children are left to the status observer.
    pub async fn abort_node(&self, id: &str) -> Result<bool> {
        let failure = FailureInfo::new(FailureType::Aborted, "node execution aborted");
        let Some(aborted) = self
            .nodes
            .update_status_with_ops(
                id,
                &Status::non_final(),
                Status::Aborted,
                vec![NodeUpdate::SetFailure(failure)],
            )
            .await?
        else {
            return Ok(false);
        };
        info!(node_execution_id = %id, "Node execution aborted");
        self.on_terminal(aborted, true).await?;
        Ok(true)
    }

    /// ERRORED for a RUNNING node whose worker went away before it suspended
    pub(crate) async fn interrupt_node(&self, id: &str) -> Result<bool> {
        let failure = FailureInfo::new(
            FailureType::Interrupted,
            "node was running when the engine stopped",
        );
        let Some(errored) = self
            .nodes
            .update_status_with_ops(
                id,
                &[Status::Running],
                Status::Errored,
                vec![NodeUpdate::SetFailure(failure)],
            )
            .await?
        else {
            return Ok(false);
        };
        warn!(node_execution_id = %id, "Interrupted node marked errored");
        self.on_terminal(errored, true).await?;
        Ok(true)
    }

    /// Force every non-final node of a plan execution to ERRORED.
    /// No advice runs; returns the number of nodes changed.
    pub async fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<usize> {
        let active: Vec<NodeExecution> = self
            .nodes
            .fetch_by_plan_execution(plan_execution_id)
            .await?
            .into_iter()
            .filter(|exec| !exec.status.is_terminal())
            .collect();

        let mut changed = 0;
        for exec in active {
            let failure = FailureInfo::new(FailureType::Interrupted, "plan execution errored out");
            if let Some(errored) = self
                .nodes
                .update_status_with_ops(
                    &exec.id,
                    &Status::non_final(),
                    Status::Errored,
                    vec![NodeUpdate::SetFailure(failure)],
                )
                .await?
            {
                self.on_terminal(errored, false).await?;
                changed += 1;
            }
        }
        warn!(plan_execution_id, changed, "Errored out active nodes");
        Ok(changed)
    }

    /// Terminalize a node as ERRORED after an engine-side failure, then hand the error back
    async fn fail_processing(&self, id: &str, error: EngineError) -> Result<()> {
        let failure_type = if error.is_configuration() {
            FailureType::Configuration
        } else if matches!(
            error,
            EngineError::BrokerDelivery { .. } | EngineError::TaskDispatch { .. }
        ) {
            FailureType::Delivery
        } else {
            FailureType::Application
        };
        error!(node_execution_id = %id, error = %error, "Node processing failed");

        let failure = FailureInfo::new(failure_type, error.to_string());
        match self
            .nodes
            .update_status_with_ops(
                id,
                &Status::non_final(),
                Status::Errored,
                vec![NodeUpdate::SetFailure(failure)],
            )
            .await
        {
            Ok(Some(errored)) => {
                if let Err(e) = self.on_terminal(errored, true).await {
                    error!(node_execution_id = %id, error = %e, "Advice after error failed");
                }
            }
            Ok(None) => {}
            Err(e) => error!(node_execution_id = %id, error = %e, "Failed to mark node errored"),
        }
        Err(error)
    }

    /// Supply input for an INPUT_WAITING node; see `ExecutionInputGate::supply_input`
    pub async fn supply_input(&self, instance_id: &str, input: serde_json::Value) -> Result<bool> {
        self.gate.supply_input(instance_id, input).await
    }

    /// Deliver the result of a dispatched task
    pub fn report_task_result(&self, correlation_id: &str, result: &TaskResult) -> Result<()> {
        crate::task::report_task_result(&self.broker, correlation_id, result)
    }

    /// Deliver a response for an async callback id
    pub fn notify_callback(&self, callback_id: &str, payload: impl Into<bytes::Bytes>) -> Result<()> {
        self.broker.fulfilled(callback_id, payload.into())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<NodeExecution>> {
        self.nodes.get(id).await
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        self.nodes.fetch_children(parent_id).await
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<EngineEventEnvelope> {
        self.events.subscribe()
    }

    /// Run the status sweep against the current store
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let engine = self
            .weak_self
            .upgrade()
            .ok_or(EngineError::ShuttingDown)?;
        Recovery::new(engine).sweep().await
    }

    /// Stop accepting jobs and wait for running ones to finish
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Engine shutting down");
        let permits = u32::try_from(self.config.max_workers).unwrap_or(u32::MAX);
        let _all = self
            .workers
            .acquire_many(permits)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.workers.close();
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn broker(&self) -> &NotifyBroker {
        &self.broker
    }

    pub fn input_gate(&self) -> &ExecutionInputGate {
        &self.gate
    }

    pub fn node_store(&self) -> &Arc<dyn NodeExecutionStore> {
        &self.nodes
    }

    pub fn input_store(&self) -> &Arc<dyn ExecutionInputStore> {
        &self.inputs
    }
}

fn new_id() -> String {
    cuid2::create_id()
}

fn level_for(node: &PlanNode, runtime_id: &str) -> Level {
    Level {
        setup_id: node.id.clone(),
        runtime_id: runtime_id.to_string(),
        identifier: node.identifier.clone(),
        step_type: node.step_type.clone(),
    }
}

/// Builder for `Engine`
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<(Arc<dyn NodeExecutionStore>, Arc<dyn ExecutionInputStore>)>,
    tasks: Option<Arc<dyn TaskExecutor>>,
    timeouts: Option<Arc<dyn TimeoutEngine>>,
    steps: Option<Arc<StepRegistry>>,
    plans: Vec<Plan>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            tasks: None,
            timeouts: None,
            steps: None,
            plans: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use one store for both node executions and input instances
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: NodeExecutionStore + ExecutionInputStore + 'static,
    {
        let nodes: Arc<dyn NodeExecutionStore> = store.clone();
        let inputs: Arc<dyn ExecutionInputStore> = store;
        self.store = Some((nodes, inputs));
        self
    }

    pub fn task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.tasks = Some(executor);
        self
    }

    pub fn timeout_engine(mut self, engine: Arc<dyn TimeoutEngine>) -> Self {
        self.timeouts = Some(engine);
        self
    }

    pub fn steps(mut self, steps: Arc<StepRegistry>) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Register a plan before recovery runs
    pub fn plan(mut self, plan: Plan) -> Self {
        self.plans.push(plan);
        self
    }

    /// Build the engine. Runs the recovery sweep when enabled in the config.
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<Arc<Engine>> {
        let config = self.config;
        config.validate()?;

        let (nodes, inputs) = match self.store {
            Some(store) => store,
            None => match &config.db_path {
                Some(_) => {
                    let store = Arc::new(SledStore::from_config(&config)?);
                    let nodes: Arc<dyn NodeExecutionStore> = store.clone();
                    let inputs: Arc<dyn ExecutionInputStore> = store;
                    (nodes, inputs)
                }
                None => {
                    let store = Arc::new(MemoryStore::new());
                    let nodes: Arc<dyn NodeExecutionStore> = store.clone();
                    let inputs: Arc<dyn ExecutionInputStore> = store;
                    (nodes, inputs)
                }
            },
        };
        let tasks = self
            .tasks
            .unwrap_or_else(|| Arc::new(UnconfiguredTaskExecutor));
        let timeouts = self
            .timeouts
            .unwrap_or_else(|| Arc::new(TokioTimeoutEngine::new()));
        let steps = self.steps.unwrap_or_default();

        let metrics = Arc::new(EngineMetrics::new());
        let events = Arc::new(EventBus::new(config.event_capacity));
        let broker = NotifyBroker::new(config.broker_partitions);
        let workers = Arc::new(Semaphore::new(config.max_workers));

        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            weak_self: weak.clone(),
            plans: DashMap::new(),
            tracker: TimeoutTracker::new(nodes.clone(), timeouts.clone(), metrics.clone()),
            accumulator: ResponseAccumulator::new(nodes.clone()),
            gate: ExecutionInputGate::new(
                weak.clone(),
                nodes.clone(),
                inputs.clone(),
                broker.clone(),
                events.clone(),
                metrics.clone(),
                config.input_validity_months,
            ),
            factory: ExecutableProcessorFactory,
            nodes,
            inputs,
            broker,
            timeouts,
            tasks,
            steps,
            events,
            metrics,
            workers,
            shutting_down: AtomicBool::new(false),
            config,
        });

        for plan in self.plans {
            engine.register_plan(plan)?;
        }
        if engine.config.enable_recovery {
            let stats = engine.recover().await?;
            if !stats.is_empty() {
                info!(?stats, "Recovered node executions");
            }
        }
        info!(
            max_workers = engine.config.max_workers,
            broker_partitions = engine.config.broker_partitions,
            "Engine ready"
        );
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionMode, StepType};

    fn plan() -> Plan {
        Plan::new("p", "fork")
            .with_node(
                PlanNode::new("fork", StepType::step("FORK"), ExecutionMode::Children)
                    .with_children(["leaf"]),
            )
            .with_node(
                PlanNode::new("leaf", StepType::step("ECHO"), ExecutionMode::Sync).with_next("after"),
            )
            .with_node(PlanNode::new("after", StepType::step("ECHO"), ExecutionMode::Sync))
    }

    #[tokio::test]
    async fn test_children_skipped_for_gone_parent_stay_quiet_on_recovery() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::builder()
            .config(EngineConfig {
                enable_recovery: false,
                ..EngineConfig::development()
            })
            .store(store.clone())
            .plan(plan())
            .build()
            .await
            .unwrap();

        let plan = engine.plan("p").unwrap();
        let mut parent = NodeExecution::queued(
            "parent",
            Ambiance::new("p", "pe-gone"),
            "p",
            plan.node("fork").unwrap(),
            None,
            None,
        );
        parent.status = Status::Aborted;
        parent.concluded = true;
        store.save(&parent).await.unwrap();

        let child = engine.prepare_child(&parent, "leaf").unwrap();
        let response = ExecutableResponse::Children {
            children: vec![engine.child_instance(&child)],
        };
        let mut events = engine.subscribe();
        assert!(!engine
            .suspend_on_children(&parent, response, vec![child.clone()])
            .await
            .unwrap());

        let skipped = store.get_required(&child.id).await.unwrap();
        assert_eq!(skipped.status, Status::Skipped);
        assert!(skipped.concluded);
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event.event,
            EngineEvent::StatusChanged { status: Status::Skipped, .. }
        ));

        let stats = engine.recover().await.unwrap();
        assert_eq!(stats.advice_replayed, 0);
        assert_eq!(stats.failed, 0);
        // No sibling was started for the skipped child
        assert_eq!(store.fetch_by_plan_execution("pe-gone").await.unwrap().len(), 2);
        assert_eq!(engine.broker().parked_responses(), 0);
    }
}

