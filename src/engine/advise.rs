use std::time::Duration;

use crate::model::{NodeExecution, PlanNode, Status};

/// What to do once a node is terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advice {
    /// Run the same plan node again after `wait`
    Retry { wait: Duration },
    /// Start the next sibling under the same parent
    NextNode { node_id: String },
    /// Report to the parent (or finish the plan)
    End,
}

pub fn advise(execution: &NodeExecution, node: &PlanNode, default_wait: Duration) -> Advice {
    let status = execution.status;
    if status == Status::Aborted {
        return Advice::End;
    }

    if let Some(retry) = &node.advisers.retry {
        if retry.on_statuses.contains(&status) && execution.retry_count < retry.max_retries {
            return Advice::Retry {
                wait: retry.wait.unwrap_or(default_wait),
            };
        }
    }

    if status.is_positive() || node.advisers.ignore_failure {
        if let Some(next) = &node.advisers.next_node_id {
            return Advice::NextNode {
                node_id: next.clone(),
            };
        }
    }

    Advice::End
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ambiance, ExecutionMode, RetryPolicy, StepType};

    fn finished(node: &PlanNode, status: Status, retry_count: u32) -> NodeExecution {
        let mut exec =
            NodeExecution::queued("e", Ambiance::new("p", "pe"), "p", node, None, None);
        exec.status = status;
        exec.retry_count = retry_count;
        exec
    }

    #[test]
    fn test_retry_until_exhausted() {
        let node = PlanNode::new("n", StepType::step("S"), ExecutionMode::Sync)
            .with_retry(RetryPolicy::new(2))
            .with_next("m");
        let wait = Duration::from_millis(5);

        assert_eq!(
            advise(&finished(&node, Status::Failed, 0), &node, wait),
            Advice::Retry { wait }
        );
        assert_eq!(
            advise(&finished(&node, Status::Failed, 2), &node, wait),
            Advice::End
        );
    }

    #[test]
    fn test_next_node_on_success_or_ignored_failure() {
        let node = PlanNode::new("n", StepType::step("S"), ExecutionMode::Sync).with_next("m");
        assert_eq!(
            advise(&finished(&node, Status::Skipped, 0), &node, Duration::ZERO),
            Advice::NextNode {
                node_id: "m".into()
            }
        );
        assert_eq!(
            advise(&finished(&node, Status::Failed, 0), &node, Duration::ZERO),
            Advice::End
        );

        let lenient = node.clone().ignoring_failure();
        assert_eq!(
            advise(&finished(&lenient, Status::Failed, 0), &lenient, Duration::ZERO),
            Advice::NextNode {
                node_id: "m".into()
            }
        );
    }

    #[test]
    fn test_abort_always_ends() {
        let node = PlanNode::new("n", StepType::step("S"), ExecutionMode::Sync)
            .with_retry(RetryPolicy {
                max_retries: 3,
                wait: None,
                on_statuses: vec![Status::Aborted],
            })
            .with_next("m")
            .ignoring_failure();
        assert_eq!(
            advise(&finished(&node, Status::Aborted, 0), &node, Duration::ZERO),
            Advice::End
        );
    }
}
