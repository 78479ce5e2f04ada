//! Foundation types for the praxis durable execution engine.
//!
//! This module hides the event serialization format and the shapes shared by
//! every layer: history events, workflow instances, tasks, payloads, and the
//! injectable clock.

mod clock;
mod error;
mod event;
mod instance;
mod serialization;
mod task;

pub use clock::{Clock, SystemClock};
pub use error::{CoreError, Result};
pub use event::{
    deserialize_event, serialize_event, Event, EventAttributes, EventType, WorkflowEvent,
};
pub use instance::{ParentInstance, WorkflowInstance, WorkflowState};
pub use serialization::{from_payload, to_payload, IntoInputs, Payload};
pub use task::{ActivityTask, WorkflowTask};
