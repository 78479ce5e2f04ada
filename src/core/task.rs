use super::event::Event;
use super::instance::WorkflowInstance;

/// A unit of workflow work delivered with a lease.
///
/// `id` is the lease handle: extension and completion refer to it. The task
/// carries the persisted history for replay and the pending buffer contents
/// as `new_events`; the buffer itself is only trimmed at checkpoint time, up
/// to `last_pending_event_id`.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub id: String,
    pub instance: WorkflowInstance,
    pub history: Vec<Event>,
    pub new_events: Vec<Event>,
    pub last_pending_event_id: Option<String>,
}

/// A unit of activity work delivered with a lease.
///
/// `event` is the `ActivityScheduled` history event describing what to run;
/// its id becomes the `schedule_event_id` of the completion event.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub id: String,
    pub instance: WorkflowInstance,
    pub event: Event,
}
