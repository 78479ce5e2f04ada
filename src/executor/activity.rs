//! Activity invocation.

use super::registry::{ActivityContext, Registry};
use crate::core::{ActivityTask, EventAttributes, Payload};
use crate::executor::ExecutionError;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Invokes registered activity functions for dequeued activity tasks.
///
/// Activities run real side effects; the engine guarantees at-least-once
/// execution, so functions should be idempotent where it matters.
pub struct ActivityExecutor {
    registry: Arc<RwLock<Registry>>,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<RwLock<Registry>>) -> Self {
        Self { registry }
    }

    /// Runs the activity named by the task's `ActivityScheduled` event and
    /// returns its serialized result, or the failure reason recorded as an
    /// `ActivityFailed` event.
    pub async fn execute(&self, task: &ActivityTask) -> Result<Option<Payload>, String> {
        let EventAttributes::ActivityScheduled { name, inputs } = &task.event.attributes else {
            return Err("activity task does not carry an ActivityScheduled event".to_string());
        };

        // Clone the handler out so the registry lock is not held across the
        // activity's await points.
        let handler = {
            let registry = self.registry.read().unwrap();
            registry.activity_handler(name)
        };
        let Some(handler) = handler else {
            return Err(ExecutionError::ActivityNotFound(name.clone()).to_string());
        };

        debug!(instance = %task.instance, activity = %name, "executing activity");
        let ctx = ActivityContext {
            instance: task.instance.clone(),
            schedule_event_id: task.event.id,
        };
        handler(ctx, inputs.clone()).await
    }
}
