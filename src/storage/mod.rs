//! Persistence and queueing layer for the praxis durable execution engine.
//!
//! This module hides the storage choice behind the [`Backend`] trait: an
//! event-sourced history per workflow instance plus two lease-based task
//! queues (workflow and activity). Two implementations are provided:
//!
//! - [`InMemoryBackend`]: the reference implementation, suitable for tests
//!   and single-process deployments.
//! - `RedisBackend` (behind the `redis` feature): a log-structured
//!   implementation over Redis streams and consumer groups.

mod error;
mod memory;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
mod taskqueue;

pub use error::{BackendError, Result};
pub use memory::{InMemoryBackend, MemoryBackendOptions};

#[cfg(feature = "redis")]
pub use redis::{RedisBackend, RedisOptions};

use crate::core::{ActivityTask, Event, WorkflowEvent, WorkflowInstance, WorkflowState, WorkflowTask};
use async_trait::async_trait;
use std::time::Duration;

/// Storage backend contract: per-instance histories plus lease-based
/// workflow and activity task queues.
///
/// All operations are atomic: they either take full effect or leave storage
/// unchanged. Implementations must be thread-safe; `async_trait` keeps the
/// interface usable with truly async drivers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Initializes a new instance with `event.event` (an `ExecutionStarted`)
    /// as the first history entry and enqueues a workflow task, atomically.
    ///
    /// Fails with `InstanceAlreadyExists` if the instance is present.
    async fn create_workflow_instance(&self, event: WorkflowEvent) -> Result<()>;

    /// Appends a cancellation event to the instance's pending buffer and
    /// ensures the instance is enqueued.
    ///
    /// Fails with `InstanceNotFound` if the instance is absent or finished.
    async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: Event,
    ) -> Result<()>;

    /// Appends a `SignalReceived` event to the pending buffer of the
    /// instance's current execution and ensures it is enqueued.
    ///
    /// Fails with `InstanceNotFound` if the instance is absent or finished.
    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<()>;

    /// Returns whether the instance is `Active` or `Finished`.
    async fn get_workflow_instance_state(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowState>;

    /// Returns the ordered history slice with `sequence_id` greater than
    /// `after_sequence_id`, or the full history when absent.
    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
        after_sequence_id: Option<i64>,
    ) -> Result<Vec<Event>>;

    /// Blocking dequeue with lease acquisition.
    ///
    /// Returns `Ok(None)` on timeout so callers can distinguish an idle
    /// queue from a failure. The delivered `new_events` are the pending
    /// buffer contents at lease time; the buffer is only trimmed by
    /// [`Backend::complete_workflow_task`].
    async fn get_workflow_task(&self, timeout: Duration) -> Result<Option<WorkflowTask>>;

    /// Resets the lease timer of a workflow task. Fails with `LeaseLost` if
    /// the lease has expired and been stolen.
    async fn extend_workflow_task(
        &self,
        task_id: &str,
        instance: &WorkflowInstance,
    ) -> Result<()>;

    /// The atomic checkpoint. Appends `executed_events` to the history with
    /// dense sequence ids, trims the delivered pending prefix, enqueues
    /// `activity_events`, routes `workflow_events` to their target
    /// instances (creating them for `ExecutionStarted`, or parking them in
    /// the future-event index when `visible_at` is set), flips the instance
    /// state, and releases the lease — all or nothing.
    ///
    /// Fails with `LeaseLost` when the lease is gone (results must be
    /// discarded), `InstanceMismatch` when `instance` differs from the
    /// task's stored instance, or `InstanceNotFound`.
    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        instance: &WorkflowInstance,
        state: WorkflowState,
        executed_events: Vec<Event>,
        activity_events: Vec<Event>,
        workflow_events: Vec<WorkflowEvent>,
    ) -> Result<()>;

    /// Blocking dequeue of an activity task with lease acquisition.
    /// Returns `Ok(None)` on timeout.
    async fn get_activity_task(&self, timeout: Duration) -> Result<Option<ActivityTask>>;

    /// Completes an activity task: routes the completion `event` into the
    /// originating workflow's pending buffer and enqueues a workflow task
    /// for it, atomically with removing the activity from its queue.
    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<()>;

    /// Resets the lease timer of an activity task.
    async fn extend_activity_task(&self, task_id: &str) -> Result<()>;
}
