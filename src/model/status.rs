use serde::{Deserialize, Serialize};

/// Status of a node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    InputWaiting,
    Paused,
    Succeeded,
    Failed,
    Expired,
    Aborted,
    Skipped,
    Errored,
}

impl Status {
    pub const ALL: [Status; 12] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::InputWaiting,
        Status::Paused,
        Status::Succeeded,
        Status::Failed,
        Status::Expired,
        Status::Aborted,
        Status::Skipped,
        Status::Errored,
    ];

    pub const TERMINAL: [Status; 6] = [
        Status::Succeeded,
        Status::Failed,
        Status::Expired,
        Status::Aborted,
        Status::Skipped,
        Status::Errored,
    ];

    /// Statuses a resume callback may find a node in
    pub const RESUMABLE: [Status; 3] = [Status::Running, Status::AsyncWaiting, Status::TaskWaiting];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Status::AsyncWaiting | Status::TaskWaiting | Status::InputWaiting
        )
    }

    /// Outcomes that let a chain advance to the next node
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    pub fn non_final() -> Vec<Status> {
        Self::ALL.iter().copied().filter(|s| !s.is_terminal()).collect()
    }

    /// Terminal statuses are absorbing; QUEUED is only re-entered from INPUT_WAITING
    pub fn can_transition_to(self, next: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Status::Queued => self == Status::InputWaiting,
            _ => true,
        }
    }

    /// Combine child outcomes into one parent outcome
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let statuses: Vec<Status> = statuses.into_iter().collect();
        if statuses.is_empty() {
            return Status::Succeeded;
        }
        for worst in [
            Status::Aborted,
            Status::Errored,
            Status::Failed,
            Status::Expired,
        ] {
            if statuses.contains(&worst) {
                return worst;
            }
        }
        if statuses.iter().any(|s| !s.is_terminal()) {
            return Status::Running;
        }
        if statuses.iter().all(|s| *s == Status::Skipped) {
            return Status::Skipped;
        }
        Status::Succeeded
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::InputWaiting => "INPUT_WAITING",
            Status::Paused => "PAUSED",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Errored => "ERRORED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown node execution status: {}", s))
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_is_absorbing() {
        for terminal in Status::TERMINAL {
            for next in Status::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_queued_only_reentered_from_input_waiting() {
        assert!(Status::InputWaiting.can_transition_to(Status::Queued));
        assert!(!Status::Running.can_transition_to(Status::Queued));
        assert!(!Status::Queued.can_transition_to(Status::Queued));
        assert!(Status::Queued.can_transition_to(Status::Running));
        assert!(Status::AsyncWaiting.can_transition_to(Status::Running));
    }

    #[test]
    fn test_aggregate() {
        assert_eq!(Status::aggregate(Vec::<Status>::new()), Status::Succeeded);
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Failed]),
            Status::Failed
        );
        assert_eq!(
            Status::aggregate([Status::Skipped, Status::Skipped]),
            Status::Skipped
        );
        assert_eq!(
            Status::aggregate([Status::Skipped, Status::Succeeded]),
            Status::Succeeded
        );
        assert_eq!(
            Status::aggregate([Status::Failed, Status::Aborted]),
            Status::Aborted
        );
    }

    #[test]
    fn test_string_round_trip() {
        assert_eq!(Status::from_str("INPUT_WAITING"), Ok(Status::InputWaiting));
        assert!(Status::from_str("DISCONTINUING").is_err());
        assert_eq!(
            serde_json::to_string(&Status::TaskWaiting).unwrap(),
            "\"TASK_WAITING\""
        );
    }
}
