use serde::{Deserialize, Serialize};

use crate::model::StepType;

/// One hop of the hierarchical address: which plan node, which run of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub setup_id: String,
    pub runtime_id: String,
    pub identifier: String,
    pub step_type: StepType,
}

/// Hierarchical addressing context threaded through every node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub plan_id: String,
    pub plan_execution_id: String,
    pub levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(plan_id: impl Into<String>, plan_execution_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            plan_execution_id: plan_execution_id.into(),
            ..Default::default()
        }
    }

    pub fn with_scope(
        mut self,
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        self.account_id = account_id.into();
        self.org_id = org_id.into();
        self.project_id = project_id.into();
        self
    }

    /// Copy of this ambiance one level deeper
    pub fn child(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    pub fn runtime_id(&self) -> Option<&str> {
        self.levels.last().map(|l| l.runtime_id.as_str())
    }

    /// Dotted identifier path, e.g. `pipeline.stages.deploy`
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_levels() {
        let root = Ambiance::new("plan", "exec-1").with_scope("acc", "org", "proj");
        let stage = root.child(Level {
            setup_id: "stage-node".into(),
            runtime_id: "rt-1".into(),
            identifier: "deploy".into(),
            step_type: StepType::step("STAGE"),
        });
        let step = stage.child(Level {
            setup_id: "step-node".into(),
            runtime_id: "rt-2".into(),
            identifier: "shell".into(),
            step_type: StepType::step("SHELL"),
        });

        assert!(root.levels.is_empty());
        assert_eq!(step.runtime_id(), Some("rt-2"));
        assert_eq!(step.fqn(), "deploy.shell");
        assert_eq!(step.account_id, "acc");
    }
}
