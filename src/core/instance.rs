use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Linkage from a sub-workflow back to the instance that scheduled it.
///
/// `schedule_event_id` is the id of the `SubWorkflowScheduled` event in the
/// parent's history; completion events routed to the parent carry it so the
/// parent's executor can resolve the matching future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInstance {
    pub instance_id: String,
    pub schedule_event_id: Uuid,
}

/// A single logical execution of a workflow.
///
/// `instance_id` is user-supplied and identifies the logical workflow;
/// `execution_id` is generated per attempt so re-runs and continue-as-new
/// get distinct histories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentInstance>,
}

impl WorkflowInstance {
    /// Creates a top-level workflow instance.
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: None,
        }
    }

    /// Creates a sub-workflow instance linked to its parent.
    pub fn new_sub_workflow(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        parent_instance_id: impl Into<String>,
        parent_schedule_event_id: Uuid,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: Some(ParentInstance {
                instance_id: parent_instance_id.into(),
                schedule_event_id: parent_schedule_event_id,
            }),
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        self.parent.is_some()
    }
}

impl std::fmt::Display for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.execution_id)
    }
}

/// Lifecycle state of a workflow instance.
///
/// Transitions are driven exclusively by `complete_workflow_task`; once
/// `Finished`, no further events may be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Active,
    Finished,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Active => "ACTIVE",
            WorkflowState::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(WorkflowState::Active),
            "FINISHED" => Ok(WorkflowState::Finished),
            _ => Err(format!("unknown workflow state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_workflow_linkage() {
        let schedule_id = Uuid::new_v4();
        let sub = WorkflowInstance::new_sub_workflow("child", "exec-1", "parent", schedule_id);
        assert!(sub.is_sub_workflow());
        let parent = sub.parent.unwrap();
        assert_eq!(parent.instance_id, "parent");
        assert_eq!(parent.schedule_event_id, schedule_id);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [WorkflowState::Active, WorkflowState::Finished] {
            assert_eq!(state.as_str().parse::<WorkflowState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<WorkflowState>().is_err());
    }
}
