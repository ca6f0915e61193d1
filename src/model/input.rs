use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputState {
    Waiting,
    Fulfilled,
    Expired,
}

impl InputState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputState::Waiting => "WAITING",
            InputState::Fulfilled => "FULFILLED",
            InputState::Expired => "EXPIRED",
        }
    }
}

/// A node parked until someone supplies input for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInputInstance {
    /// Also the broker wait key
    pub instance_id: String,
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub template: Value,
    #[serde(default)]
    pub merged_input: Option<Value>,
    pub state: InputState,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl ExecutionInputInstance {
    pub fn new(
        instance_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        plan_execution_id: impl Into<String>,
        template: Value,
        validity_months: u32,
    ) -> Self {
        let created_at = Utc::now();
        let valid_until = created_at
            .checked_add_months(Months::new(validity_months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            instance_id: instance_id.into(),
            node_execution_id: node_execution_id.into(),
            plan_execution_id: plan_execution_id.into(),
            template,
            merged_input: None,
            state: InputState::Waiting,
            created_at,
            valid_until,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == InputState::Waiting && now >= self.valid_until
    }

    /// Time left before the wait is abandoned, zero when already overdue
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.valid_until - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_validity_window() {
        let instance = ExecutionInputInstance::new("in-1", "exec-1", "pe-1", json!({}), 6);
        let days = (instance.valid_until - instance.created_at).num_days();
        assert!((180..=186).contains(&days), "got {days} days");
        assert!(!instance.is_overdue(Utc::now()));
        assert!(instance.is_overdue(instance.valid_until + Duration::seconds(1)));
        assert_eq!(
            instance.remaining(instance.valid_until + Duration::seconds(1)),
            std::time::Duration::ZERO
        );
    }
}
