use serde_json::Value;

use crate::model::{NodeExecution, PlanNode, ResponseMap};

/// Everything a strategy needs to start a node. Built per call, never shared.
#[derive(Debug, Clone)]
pub struct InvokerPackage {
    pub execution: NodeExecution,
    pub plan_node: PlanNode,
    /// Step parameters merged with any supplied execution input
    pub inputs: Value,
}

impl InvokerPackage {
    pub fn new(execution: NodeExecution, plan_node: PlanNode) -> Self {
        let inputs = match &execution.resolved_input {
            Some(resolved) => merge_inputs(&plan_node.step_parameters, resolved),
            None => plan_node.step_parameters.clone(),
        };
        Self {
            execution,
            plan_node,
            inputs,
        }
    }
}

/// Everything a strategy needs to resume a node after its wait completed
#[derive(Debug, Clone)]
pub struct ResumePackage {
    pub execution: NodeExecution,
    pub plan_node: PlanNode,
    pub responses: ResponseMap,
    /// Set when the broker reported an error instead of a response
    pub async_error: bool,
}

impl ResumePackage {
    pub fn new(execution: NodeExecution, plan_node: PlanNode, responses: ResponseMap) -> Self {
        Self {
            execution,
            plan_node,
            responses,
            async_error: false,
        }
    }
}

/// Shallow merge: object keys of `input` override `params`
pub fn merge_inputs(params: &Value, input: &Value) -> Value {
    match (params, input) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (k, v) in extra {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (Value::Null, other) => other.clone(),
        (base, Value::Null) => base.clone(),
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_inputs() {
        let merged = merge_inputs(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(merge_inputs(&Value::Null, &json!({"x": 1})), json!({"x": 1}));
        assert_eq!(merge_inputs(&json!({"x": 1}), &Value::Null), json!({"x": 1}));
    }
}
