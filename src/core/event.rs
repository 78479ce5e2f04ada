use super::error::{CoreError, Result};
use super::instance::WorkflowInstance;
use super::serialization::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type-specific event payload, keyed by the event type.
///
/// Serialized as a tagged sum: the `type` field names the variant and the
/// `attributes` field carries the variant data, giving the self-describing
/// JSON form `{"type": "...", "attributes": {...}}` flattened into the
/// enclosing [`Event`]. Unknown types are rejected on read by serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "attributes")]
pub enum EventAttributes {
    /// First event of every history; carries the workflow name and inputs.
    ExecutionStarted {
        name: String,
        inputs: Vec<Payload>,
    },
    /// Terminal event for a workflow that ran to completion or failed.
    ExecutionFinished {
        result: Option<Payload>,
        error: Option<String>,
    },
    /// Terminal event for a canceled workflow.
    ExecutionCanceled,
    /// Terminal event for a terminated workflow.
    ExecutionTerminated,
    /// Marks the start of a workflow task within the history.
    TaskStarted,
    ActivityScheduled {
        name: String,
        inputs: Vec<Payload>,
    },
    ActivityCompleted {
        result: Option<Payload>,
    },
    ActivityFailed {
        reason: String,
    },
    TimerScheduled {
        fire_at: DateTime<Utc>,
    },
    TimerFired,
    SignalReceived {
        name: String,
        arg: Option<Payload>,
    },
    SubWorkflowScheduled {
        name: String,
        instance_id: String,
        inputs: Vec<Payload>,
    },
    SubWorkflowCompleted {
        result: Option<Payload>,
        error: Option<String>,
    },
    SubWorkflowCancellationRequested {
        instance_id: String,
    },
}

/// Discriminant of [`EventAttributes`], for matching without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExecutionStarted,
    ExecutionFinished,
    ExecutionCanceled,
    ExecutionTerminated,
    TaskStarted,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    SignalReceived,
    SubWorkflowScheduled,
    SubWorkflowCompleted,
    SubWorkflowCancellationRequested,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted => "ExecutionStarted",
            EventType::ExecutionFinished => "ExecutionFinished",
            EventType::ExecutionCanceled => "ExecutionCanceled",
            EventType::ExecutionTerminated => "ExecutionTerminated",
            EventType::TaskStarted => "TaskStarted",
            EventType::ActivityScheduled => "ActivityScheduled",
            EventType::ActivityCompleted => "ActivityCompleted",
            EventType::ActivityFailed => "ActivityFailed",
            EventType::TimerScheduled => "TimerScheduled",
            EventType::TimerFired => "TimerFired",
            EventType::SignalReceived => "SignalReceived",
            EventType::SubWorkflowScheduled => "SubWorkflowScheduled",
            EventType::SubWorkflowCompleted => "SubWorkflowCompleted",
            EventType::SubWorkflowCancellationRequested => "SubWorkflowCancellationRequested",
        }
    }

    /// Terminal events close the instance; nothing may be appended after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::ExecutionFinished
                | EventType::ExecutionCanceled
                | EventType::ExecutionTerminated
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::ExecutionStarted { .. } => EventType::ExecutionStarted,
            EventAttributes::ExecutionFinished { .. } => EventType::ExecutionFinished,
            EventAttributes::ExecutionCanceled => EventType::ExecutionCanceled,
            EventAttributes::ExecutionTerminated => EventType::ExecutionTerminated,
            EventAttributes::TaskStarted => EventType::TaskStarted,
            EventAttributes::ActivityScheduled { .. } => EventType::ActivityScheduled,
            EventAttributes::ActivityCompleted { .. } => EventType::ActivityCompleted,
            EventAttributes::ActivityFailed { .. } => EventType::ActivityFailed,
            EventAttributes::TimerScheduled { .. } => EventType::TimerScheduled,
            EventAttributes::TimerFired => EventType::TimerFired,
            EventAttributes::SignalReceived { .. } => EventType::SignalReceived,
            EventAttributes::SubWorkflowScheduled { .. } => EventType::SubWorkflowScheduled,
            EventAttributes::SubWorkflowCompleted { .. } => EventType::SubWorkflowCompleted,
            EventAttributes::SubWorkflowCancellationRequested { .. } => {
                EventType::SubWorkflowCancellationRequested
            }
        }
    }
}

/// A single entry in a workflow instance's history.
///
/// `id` is the stable identifier used for dedup and correlation.
/// `sequence_id` is assigned by the backend when the event is committed to
/// history and is dense and strictly increasing per instance; pending events
/// that have not been checkpointed yet carry `sequence_id == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,

    #[serde(default)]
    pub sequence_id: i64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub attributes: EventAttributes,

    /// For completion events, the id of the event that scheduled the
    /// operation; ties futures to their resolutions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_event_id: Option<Uuid>,

    /// Events with a visibility time are held back and only delivered to
    /// their target instance once the wall clock passes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Creates a new pending event with a fresh id and no sequence number.
    pub fn new(timestamp: DateTime<Utc>, attributes: EventAttributes) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id: 0,
            timestamp,
            attributes,
            schedule_event_id: None,
            visible_at: None,
        }
    }

    pub fn with_schedule_event_id(mut self, schedule_event_id: Uuid) -> Self {
        self.schedule_event_id = Some(schedule_event_id);
        self
    }

    pub fn with_visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = Some(visible_at);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }
}

/// An event addressed to a specific workflow instance.
///
/// Produced by executors for cross-instance effects: starting sub-workflows,
/// notifying parents of completion, timer self-delivery, and cancellation
/// propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance: WorkflowInstance,
    pub event: Event,
}

/// Serializes an event into its self-describing JSON form.
pub fn serialize_event(event: &Event) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(CoreError::Serialization)
}

/// Deserializes an event, rejecting unknown event types.
pub fn deserialize_event(bytes: &[u8]) -> Result<Event> {
    serde_json::from_slice(bytes).map_err(CoreError::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::serialization::to_payload;

    #[test]
    fn test_event_round_trip() {
        let event = Event::new(
            Utc::now(),
            EventAttributes::ActivityScheduled {
                name: "send-email".to_string(),
                inputs: vec![to_payload(&"to@example.com").unwrap()],
            },
        )
        .with_schedule_event_id(Uuid::new_v4());

        let bytes = serialize_event(&event).unwrap();
        let decoded = deserialize_event(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_round_trip_all_variants() {
        let now = Utc::now();
        let variants = vec![
            EventAttributes::ExecutionStarted {
                name: "wf".to_string(),
                inputs: vec![],
            },
            EventAttributes::ExecutionFinished {
                result: Some(to_payload(&42).unwrap()),
                error: None,
            },
            EventAttributes::ExecutionCanceled,
            EventAttributes::ExecutionTerminated,
            EventAttributes::TaskStarted,
            EventAttributes::ActivityCompleted {
                result: Some(to_payload(&"ok").unwrap()),
            },
            EventAttributes::ActivityFailed {
                reason: "boom".to_string(),
            },
            EventAttributes::TimerScheduled { fire_at: now },
            EventAttributes::TimerFired,
            EventAttributes::SignalReceived {
                name: "go".to_string(),
                arg: None,
            },
            EventAttributes::SubWorkflowScheduled {
                name: "child".to_string(),
                instance_id: "child-1".to_string(),
                inputs: vec![],
            },
            EventAttributes::SubWorkflowCompleted {
                result: None,
                error: Some("failed".to_string()),
            },
            EventAttributes::SubWorkflowCancellationRequested {
                instance_id: "child-1".to_string(),
            },
        ];

        for attributes in variants {
            let event = Event::new(now, attributes);
            let decoded = deserialize_event(&serialize_event(&event).unwrap()).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let raw = br#"{"id":"6b35e8a2-4f6a-41b8-9f0e-5c1f0a9d2e11","sequence_id":1,"timestamp":"2024-01-01T00:00:00Z","type":"SomethingElse","attributes":{}}"#;
        assert!(deserialize_event(raw).is_err());
    }

    #[test]
    fn test_terminal_events() {
        assert!(EventType::ExecutionFinished.is_terminal());
        assert!(EventType::ExecutionCanceled.is_terminal());
        assert!(EventType::ExecutionTerminated.is_terminal());
        assert!(!EventType::TaskStarted.is_terminal());
        assert!(!EventType::SignalReceived.is_terminal());
    }

    #[test]
    fn test_serialized_form_is_self_describing() {
        let event = Event::new(Utc::now(), EventAttributes::TimerFired);
        let value: serde_json::Value =
            serde_json::from_slice(&serialize_event(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "TimerFired");
        assert!(value["id"].is_string());
    }
}
