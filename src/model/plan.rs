//! Compiled plan graph consumed by the engine
//!
//! A plan is produced by an external compiler; the engine only reads it.
//! Parent nodes reference the plan nodes they may spawn through `children`,
//! and sequential siblings are linked through the adviser's `next_node_id`.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use crate::core::errors::{EngineError, Result};
use crate::model::Status;

/// Downstream protocol version a task-mode node dispatches with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskProtocol {
    V1,
    V2,
    V3,
}

impl TaskProtocol {
    fn suffix(self) -> &'static str {
        match self {
            TaskProtocol::V1 => "",
            TaskProtocol::V2 => "_V2",
            TaskProtocol::V3 => "_V3",
        }
    }
}

/// How a node is executed; fixed at plan-compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutionMode {
    Sync,
    Async,
    Child,
    Children,
    ChildChain,
    Task(TaskProtocol),
    TaskChain(TaskProtocol),
}

impl ExecutionMode {
    pub fn as_string(&self) -> String {
        match self {
            ExecutionMode::Sync => "SYNC".to_string(),
            ExecutionMode::Async => "ASYNC".to_string(),
            ExecutionMode::Child => "CHILD".to_string(),
            ExecutionMode::Children => "CHILDREN".to_string(),
            ExecutionMode::ChildChain => "CHILD_CHAIN".to_string(),
            ExecutionMode::Task(p) => format!("TASK{}", p.suffix()),
            ExecutionMode::TaskChain(p) => format!("TASK_CHAIN{}", p.suffix()),
        }
    }

    /// Modes whose node spawns child node executions
    pub fn is_parent(&self) -> bool {
        matches!(
            self,
            ExecutionMode::Child | ExecutionMode::Children | ExecutionMode::ChildChain
        )
    }
}

impl FromStr for ExecutionMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let mode = match s {
            "SYNC" => ExecutionMode::Sync,
            "ASYNC" => ExecutionMode::Async,
            "CHILD" => ExecutionMode::Child,
            "CHILDREN" => ExecutionMode::Children,
            "CHILD_CHAIN" => ExecutionMode::ChildChain,
            "TASK" => ExecutionMode::Task(TaskProtocol::V1),
            "TASK_V2" => ExecutionMode::Task(TaskProtocol::V2),
            "TASK_V3" => ExecutionMode::Task(TaskProtocol::V3),
            "TASK_CHAIN" => ExecutionMode::TaskChain(TaskProtocol::V1),
            "TASK_CHAIN_V2" => ExecutionMode::TaskChain(TaskProtocol::V2),
            "TASK_CHAIN_V3" => ExecutionMode::TaskChain(TaskProtocol::V3),
            other => {
                return Err(EngineError::UnknownExecutionMode {
                    mode: other.to_string(),
                })
            }
        };
        Ok(mode)
    }
}

impl TryFrom<String> for ExecutionMode {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExecutionMode> for String {
    fn from(mode: ExecutionMode) -> Self {
        mode.as_string()
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    Step,
    Fork,
    Strategy,
}

/// Step type a node runs; the key into the step registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    pub name: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            name: name.into(),
            category,
        }
    }

    pub fn step(name: impl Into<String>) -> Self {
        Self::new(name, StepCategory::Step)
    }
}

fn default_retry_statuses() -> Vec<Status> {
    vec![Status::Failed, Status::Errored, Status::Expired]
}

/// Retry a node when it ends in one of `on_statuses`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default, with = "duration_millis_opt")]
    pub wait: Option<Duration>,
    #[serde(default = "default_retry_statuses")]
    pub on_statuses: Vec<Status>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            wait: None,
            on_statuses: default_retry_statuses(),
        }
    }
}

/// What happens after the node reaches a terminal status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdviserPolicy {
    /// Sibling plan node started after this one succeeds
    #[serde(default)]
    pub next_node_id: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Advance to the next node even when this one failed
    #[serde(default)]
    pub ignore_failure: bool,
}

/// One node of the compiled plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub identifier: String,
    pub name: String,
    pub step_type: StepType,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub step_parameters: Value,
    /// Plan node ids this node may spawn as children
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default, with = "duration_millis_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub advisers: AdviserPolicy,
    /// When set the node waits for external input before it starts
    #[serde(default)]
    pub execution_input_template: Option<Value>,
}

impl PlanNode {
    pub fn new(id: impl Into<String>, step_type: StepType, mode: ExecutionMode) -> Self {
        let id = id.into();
        Self {
            identifier: id.clone(),
            name: id.clone(),
            id,
            step_type,
            mode,
            step_parameters: Value::Null,
            children: Vec::new(),
            timeout: None,
            advisers: AdviserPolicy::default(),
            execution_input_template: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_next(mut self, next_node_id: impl Into<String>) -> Self {
        self.advisers.next_node_id = Some(next_node_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.advisers.retry = Some(retry);
        self
    }

    pub fn ignoring_failure(mut self) -> Self {
        self.advisers.ignore_failure = true;
        self
    }

    pub fn with_input_template(mut self, template: Value) -> Self {
        self.execution_input_template = Some(template);
        self
    }
}

/// A compiled plan: nodes keyed by id plus the entry node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub start_node_id: String,
    pub nodes: HashMap<String, PlanNode>,
}

impl Plan {
    pub fn new(id: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_node_id: start_node_id.into(),
            nodes: HashMap::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn node(&self, node_id: &str) -> Result<&PlanNode> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound {
                plan_id: self.id.clone(),
                node_id: node_id.to_string(),
            })
    }

    /// Check references and reject cycles in the parent/next graph
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains_key(&self.start_node_id) {
            return Err(EngineError::malformed_plan(
                &self.id,
                format!("start node {} is not defined", self.start_node_id),
            ));
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(EngineError::malformed_plan(
                    &self.id,
                    format!("node keyed {} declares id {}", key, node.id),
                ));
            }
            indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }

        for node in self.nodes.values() {
            if node.mode == ExecutionMode::Child && node.children.len() != 1 {
                return Err(EngineError::malformed_plan(
                    &self.id,
                    format!(
                        "CHILD node {} must declare exactly one child, found {}",
                        node.id,
                        node.children.len()
                    ),
                ));
            }

            // Child responses are keyed by plan node id, so a repeat would shadow a sibling
            let mut seen = HashSet::with_capacity(node.children.len());
            if let Some(dup) = node.children.iter().find(|c| !seen.insert(c.as_str())) {
                return Err(EngineError::malformed_plan(
                    &self.id,
                    format!("node {} lists child {} more than once", node.id, dup),
                ));
            }

            let from = indices[node.id.as_str()];
            let targets = node
                .children
                .iter()
                .chain(node.advisers.next_node_id.iter());
            for target in targets {
                let to = indices.get(target.as_str()).ok_or_else(|| {
                    EngineError::malformed_plan(
                        &self.id,
                        format!("node {} references undefined node {}", node.id, target),
                    )
                })?;
                graph.add_edge(from, *to, ());
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            EngineError::malformed_plan(
                &self.id,
                format!("cycle detected at node {}", graph[cycle.node_id()]),
            )
        })?;

        Ok(())
    }
}

pub(crate) mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(id: &str) -> PlanNode {
        PlanNode::new(id, StepType::step("NOOP"), ExecutionMode::Sync)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "TASK_CHAIN_V2".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::TaskChain(TaskProtocol::V2)
        );
        assert_eq!(ExecutionMode::Task(TaskProtocol::V3).to_string(), "TASK_V3");

        let err = "BARRIER".parse::<ExecutionMode>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_mode_fails_deserialization() {
        let raw = json!({
            "id": "n1",
            "identifier": "n1",
            "name": "n1",
            "step_type": {"name": "NOOP", "category": "STEP"},
            "mode": "TELEPORT"
        });
        let parsed: std::result::Result<PlanNode, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_valid_plan() {
        let plan = Plan::new("p1", "root")
            .with_node(
                PlanNode::new("root", StepType::step("STAGES"), ExecutionMode::ChildChain)
                    .with_children(["a", "b"]),
            )
            .with_node(leaf("a").with_next("b"))
            .with_node(leaf("b"));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_missing_reference_rejected() {
        let plan = Plan::new("p1", "root").with_node(
            PlanNode::new("root", StepType::step("WRAP"), ExecutionMode::Child)
                .with_children(["ghost"]),
        );
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, EngineError::MalformedPlan { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let plan = Plan::new("p1", "a")
            .with_node(leaf("a").with_next("b"))
            .with_node(leaf("b").with_next("a"));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_child_mode_requires_single_child() {
        let plan = Plan::new("p1", "root")
            .with_node(
                PlanNode::new("root", StepType::step("WRAP"), ExecutionMode::Child)
                    .with_children(["a", "b"]),
            )
            .with_node(leaf("a"))
            .with_node(leaf("b"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_duplicate_child_rejected() {
        let plan = Plan::new("p1", "root")
            .with_node(
                PlanNode::new("root", StepType::step("FORK"), ExecutionMode::Children)
                    .with_children(["a", "a"]),
            )
            .with_node(leaf("a"));
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, EngineError::MalformedPlan { .. }));
        assert!(err.to_string().contains("more than once"));
    }
}
