//! In-memory reference backend.
//!
//! All state lives behind a single mutex so the checkpoint can touch the
//! history, pending buffer, both queues and the future-event index as one
//! atomic step. Blocking dequeues park on a `Notify` and re-check in short
//! slices so expired leases are recovered even without fresh enqueues.

use super::error::{BackendError, Result};
use super::Backend;
use crate::core::{
    ActivityTask, Event, EventType, WorkflowEvent, WorkflowInstance, WorkflowState, WorkflowTask,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Default task lease duration.
const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on how long a dequeue parks before re-checking for due
/// future events and expired leases.
const DEQUEUE_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Configuration for [`InMemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryBackendOptions {
    /// How long a dequeued task stays exclusively leased without extension.
    pub lease_timeout: Duration,
}

impl Default for MemoryBackendOptions {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

impl MemoryBackendOptions {
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }
}

struct InstanceEntry {
    instance: WorkflowInstance,
    state: WorkflowState,
    history: Vec<Event>,
    pending: VecDeque<Event>,
}

struct QueuedActivity {
    instance: WorkflowInstance,
    event: Event,
}

struct WorkflowLease {
    instance_id: String,
    deadline: Instant,
}

struct ActivityLease {
    instance: WorkflowInstance,
    event: Event,
    deadline: Instant,
}

struct FutureEvent {
    instance_id: String,
    event: Event,
}

#[derive(Default)]
struct Shared {
    instances: HashMap<String, InstanceEntry>,
    workflow_queue: VecDeque<String>,
    // Instance ids currently queued or being processed. Held from enqueue
    // until checkpoint so concurrent signals cannot double-schedule.
    workflow_queued: HashSet<String>,
    workflow_leases: HashMap<String, WorkflowLease>,
    activity_queue: VecDeque<QueuedActivity>,
    activity_queued: HashSet<Uuid>,
    activity_leases: HashMap<String, ActivityLease>,
    future_events: Vec<FutureEvent>,
}

/// In-memory reference implementation of [`Backend`].
pub struct InMemoryBackend {
    shared: Mutex<Shared>,
    workflow_notify: Notify,
    activity_notify: Notify,
    options: MemoryBackendOptions,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_options(MemoryBackendOptions::default())
    }

    pub fn with_options(options: MemoryBackendOptions) -> Self {
        Self {
            shared: Mutex::new(Shared::default()),
            workflow_notify: Notify::new(),
            activity_notify: Notify::new(),
            options,
        }
    }

    fn enqueue_workflow(shared: &mut Shared, instance_id: &str) {
        if shared.workflow_queued.insert(instance_id.to_string()) {
            shared.workflow_queue.push_back(instance_id.to_string());
        }
    }

    /// Moves due future events into their target pending buffers.
    /// Triggered opportunistically on every workflow dequeue.
    fn promote_future_events(shared: &mut Shared) {
        let now = Utc::now();
        let mut due = Vec::new();
        shared.future_events.retain(|fe| {
            let is_due = fe.event.visible_at.map(|at| at <= now).unwrap_or(true);
            if is_due {
                due.push((fe.instance_id.clone(), fe.event.clone()));
            }
            !is_due
        });

        for (instance_id, event) in due {
            match shared.instances.get_mut(&instance_id) {
                Some(entry) if entry.state == WorkflowState::Active => {
                    debug!(instance_id = %instance_id, event_type = %event.event_type(), "promoting future event");
                    entry.pending.push_back(event);
                    Self::enqueue_workflow(shared, &instance_id);
                }
                _ => {
                    debug!(instance_id = %instance_id, "dropping future event for missing or finished instance");
                }
            }
        }
    }

    fn build_workflow_task(task_id: String, entry: &InstanceEntry) -> WorkflowTask {
        WorkflowTask {
            id: task_id,
            instance: entry.instance.clone(),
            history: entry.history.clone(),
            new_events: entry.pending.iter().cloned().collect(),
            last_pending_event_id: entry.pending.back().map(|e| e.id.to_string()),
        }
    }

    fn try_dequeue_workflow(&self, shared: &mut Shared) -> Option<WorkflowTask> {
        let now = Instant::now();

        // Recover an expired lease first: the same task is redelivered with
        // a fresh lease window and the identical payload, since the failed
        // holder never checkpointed.
        let expired = shared
            .workflow_leases
            .iter()
            .find(|(_, lease)| lease.deadline <= now)
            .map(|(task_id, lease)| (task_id.clone(), lease.instance_id.clone()));
        if let Some((task_id, instance_id)) = expired {
            match shared.instances.get(&instance_id) {
                Some(entry) if entry.state == WorkflowState::Active => {
                    debug!(task_id = %task_id, instance_id = %instance_id, "redelivering expired workflow task");
                    let task = Self::build_workflow_task(task_id.clone(), entry);
                    shared.workflow_leases.get_mut(&task_id).unwrap().deadline =
                        now + self.options.lease_timeout;
                    return Some(task);
                }
                _ => {
                    shared.workflow_leases.remove(&task_id);
                    shared.workflow_queued.remove(&instance_id);
                }
            }
        }

        while let Some(instance_id) = shared.workflow_queue.pop_front() {
            match shared.instances.get(&instance_id) {
                Some(entry) if entry.state == WorkflowState::Active => {
                    let task_id = Uuid::new_v4().to_string();
                    let task = Self::build_workflow_task(task_id.clone(), entry);
                    shared.workflow_leases.insert(
                        task_id,
                        WorkflowLease {
                            instance_id,
                            deadline: now + self.options.lease_timeout,
                        },
                    );
                    return Some(task);
                }
                _ => {
                    // Stale queue entry for a finished or removed instance.
                    shared.workflow_queued.remove(&instance_id);
                }
            }
        }

        None
    }

    fn try_dequeue_activity(&self, shared: &mut Shared) -> Option<ActivityTask> {
        let now = Instant::now();

        let expired = shared
            .activity_leases
            .iter()
            .find(|(_, lease)| lease.deadline <= now)
            .map(|(task_id, _)| task_id.clone());
        if let Some(task_id) = expired {
            let lease = shared.activity_leases.get_mut(&task_id).unwrap();
            lease.deadline = now + self.options.lease_timeout;
            debug!(task_id = %task_id, "redelivering expired activity task");
            return Some(ActivityTask {
                id: task_id.clone(),
                instance: lease.instance.clone(),
                event: lease.event.clone(),
            });
        }

        let queued = shared.activity_queue.pop_front()?;
        let task_id = Uuid::new_v4().to_string();
        let task = ActivityTask {
            id: task_id.clone(),
            instance: queued.instance.clone(),
            event: queued.event.clone(),
        };
        shared.activity_leases.insert(
            task_id,
            ActivityLease {
                instance: queued.instance,
                event: queued.event,
                deadline: now + self.options.lease_timeout,
            },
        );
        Some(task)
    }

    /// Routes a cross-instance event: creates the target for
    /// `ExecutionStarted`, parks future events, and otherwise delivers to
    /// the target's pending buffer. Targets must be validated before
    /// calling; delivery to a finished instance is silently dropped.
    fn route_workflow_event(shared: &mut Shared, we: WorkflowEvent) {
        let target_id = we.instance.instance_id.clone();

        if we.event.event_type() == EventType::ExecutionStarted {
            let mut event = we.event;
            event.sequence_id = 1;
            shared.instances.insert(
                target_id.clone(),
                InstanceEntry {
                    instance: we.instance,
                    state: WorkflowState::Active,
                    history: vec![event],
                    pending: VecDeque::new(),
                },
            );
            Self::enqueue_workflow(shared, &target_id);
            return;
        }

        let now = Utc::now();
        if we.event.visible_at.map(|at| at > now).unwrap_or(false) {
            shared.future_events.push(FutureEvent {
                instance_id: target_id,
                event: we.event,
            });
            return;
        }

        match shared.instances.get_mut(&target_id) {
            Some(entry) if entry.state == WorkflowState::Active => {
                entry.pending.push_back(we.event);
                Self::enqueue_workflow(shared, &target_id);
            }
            _ => {
                debug!(instance_id = %target_id, event_type = %we.event.event_type(), "dropping event for missing or finished instance");
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create_workflow_instance(&self, event: WorkflowEvent) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();

        if shared.instances.contains_key(&event.instance.instance_id) {
            return Err(BackendError::InstanceAlreadyExists);
        }

        let mut started = event.event;
        started.sequence_id = 1;
        let instance_id = event.instance.instance_id.clone();
        shared.instances.insert(
            instance_id.clone(),
            InstanceEntry {
                instance: event.instance,
                state: WorkflowState::Active,
                history: vec![started],
                pending: VecDeque::new(),
            },
        );
        Self::enqueue_workflow(&mut shared, &instance_id);
        drop(shared);

        self.workflow_notify.notify_waiters();
        Ok(())
    }

    async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: Event,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let entry = shared
            .instances
            .get_mut(&instance.instance_id)
            .filter(|e| e.state == WorkflowState::Active)
            .ok_or(BackendError::InstanceNotFound)?;

        entry.pending.push_back(event);
        let instance_id = instance.instance_id.clone();
        Self::enqueue_workflow(&mut shared, &instance_id);
        drop(shared);

        self.workflow_notify.notify_waiters();
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        // Signals address the instance id alone; the entry holds the
        // current execution.
        let entry = shared
            .instances
            .get_mut(instance_id)
            .filter(|e| e.state == WorkflowState::Active)
            .ok_or(BackendError::InstanceNotFound)?;

        entry.pending.push_back(event);
        Self::enqueue_workflow(&mut shared, instance_id);
        drop(shared);

        self.workflow_notify.notify_waiters();
        Ok(())
    }

    async fn get_workflow_instance_state(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowState> {
        let shared = self.shared.lock().unwrap();
        shared
            .instances
            .get(&instance.instance_id)
            .map(|e| e.state)
            .ok_or(BackendError::InstanceNotFound)
    }

    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
        after_sequence_id: Option<i64>,
    ) -> Result<Vec<Event>> {
        let shared = self.shared.lock().unwrap();
        let entry = shared
            .instances
            .get(&instance.instance_id)
            .ok_or(BackendError::InstanceNotFound)?;

        let after = after_sequence_id.unwrap_or(0);
        Ok(entry
            .history
            .iter()
            .filter(|e| e.sequence_id > after)
            .cloned()
            .collect())
    }

    async fn get_workflow_task(&self, timeout: Duration) -> Result<Option<WorkflowTask>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut shared = self.shared.lock().unwrap();
                Self::promote_future_events(&mut shared);
                if let Some(task) = self.try_dequeue_workflow(&mut shared) {
                    return Ok(Some(task));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = DEQUEUE_WAIT_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.workflow_notify.notified()).await;
        }
    }

    async fn extend_workflow_task(
        &self,
        task_id: &str,
        instance: &WorkflowInstance,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let lease_timeout = self.options.lease_timeout;
        // An expired lease can still be extended as long as nobody stole
        // the task; only a completed or reclaimed-and-finished task fails.
        let lease = shared
            .workflow_leases
            .get_mut(task_id)
            .filter(|l| l.instance_id == instance.instance_id)
            .ok_or(BackendError::LeaseLost)?;
        lease.deadline = Instant::now() + lease_timeout;
        Ok(())
    }

    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        instance: &WorkflowInstance,
        state: WorkflowState,
        executed_events: Vec<Event>,
        activity_events: Vec<Event>,
        workflow_events: Vec<WorkflowEvent>,
    ) -> Result<()> {
        if task.instance != *instance {
            return Err(BackendError::InstanceMismatch);
        }

        let mut shared = self.shared.lock().unwrap();

        // Validate everything up front: the checkpoint is all or nothing.
        match shared.workflow_leases.get(&task.id) {
            Some(lease)
                if lease.instance_id == instance.instance_id
                    && lease.deadline > Instant::now() => {}
            // An expired lease stays behind for redelivery.
            _ => return Err(BackendError::LeaseLost),
        }

        if !shared
            .instances
            .get(&instance.instance_id)
            .map(|e| e.state == WorkflowState::Active)
            .unwrap_or(false)
        {
            return Err(BackendError::InstanceNotFound);
        }

        for we in &workflow_events {
            if we.event.event_type() == EventType::ExecutionStarted
                && shared.instances.contains_key(&we.instance.instance_id)
            {
                return Err(BackendError::InstanceAlreadyExists);
            }
        }

        // A terminal event in the executed batch forces the finished state.
        let state = if executed_events.iter().any(|e| e.is_terminal()) {
            WorkflowState::Finished
        } else {
            state
        };

        // Point of no return: apply every effect.
        let entry = shared.instances.get_mut(&instance.instance_id).unwrap();

        let mut sequence_id = entry.history.last().map(|e| e.sequence_id).unwrap_or(0);
        for mut event in executed_events {
            sequence_id += 1;
            event.sequence_id = sequence_id;
            entry.history.push(event);
        }

        if let Some(last_id) = &task.last_pending_event_id {
            // Remove exactly the prefix delivered with this task; events
            // that arrived afterwards stay for the next task.
            while let Some(front) = entry.pending.pop_front() {
                if front.id.to_string() == *last_id {
                    break;
                }
            }
        }

        let pending_remaining = !entry.pending.is_empty();
        if state == WorkflowState::Finished {
            entry.state = WorkflowState::Finished;
            entry.pending.clear();
        }

        for event in activity_events {
            if shared.activity_queued.insert(event.id) {
                shared.activity_queue.push_back(QueuedActivity {
                    instance: instance.clone(),
                    event,
                });
            }
        }

        for we in workflow_events {
            Self::route_workflow_event(&mut shared, we);
        }

        shared.workflow_leases.remove(&task.id);
        shared.workflow_queued.remove(&instance.instance_id);

        if state == WorkflowState::Finished {
            let instance_id = instance.instance_id.clone();
            shared
                .future_events
                .retain(|fe| fe.instance_id != instance_id);
            shared.workflow_queue.retain(|id| *id != instance_id);
        } else if pending_remaining {
            // Events arrived while this task was executing; schedule the
            // next task to deliver them.
            Self::enqueue_workflow(&mut shared, &instance.instance_id);
        }
        drop(shared);

        self.workflow_notify.notify_waiters();
        self.activity_notify.notify_waiters();
        Ok(())
    }

    async fn get_activity_task(&self, timeout: Duration) -> Result<Option<ActivityTask>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut shared = self.shared.lock().unwrap();
                if let Some(task) = self.try_dequeue_activity(&mut shared) {
                    return Ok(Some(task));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = DEQUEUE_WAIT_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.activity_notify.notified()).await;
        }
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();

        let lease_valid = shared
            .activity_leases
            .get(task_id)
            .map(|l| {
                l.instance.instance_id == instance.instance_id && l.deadline > Instant::now()
            })
            .unwrap_or(false);
        if !lease_valid {
            return Err(BackendError::LeaseLost);
        }
        let lease = shared.activity_leases.remove(task_id).unwrap();
        shared.activity_queued.remove(&lease.event.id);

        // Route the completion into the workflow's pending buffer. A
        // workflow that finished in the meantime just drops the result.
        match shared.instances.get_mut(&instance.instance_id) {
            Some(entry) if entry.state == WorkflowState::Active => {
                entry.pending.push_back(event);
                Self::enqueue_workflow(&mut shared, &instance.instance_id);
            }
            _ => {
                debug!(instance_id = %instance.instance_id, "dropping activity result for missing or finished instance");
            }
        }
        drop(shared);

        self.workflow_notify.notify_waiters();
        Ok(())
    }

    async fn extend_activity_task(&self, task_id: &str) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let lease_timeout = self.options.lease_timeout;
        let lease = shared
            .activity_leases
            .get_mut(task_id)
            .ok_or(BackendError::LeaseLost)?;
        lease.deadline = Instant::now() + lease_timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventAttributes;

    fn started_event() -> Event {
        Event::new(
            Utc::now(),
            EventAttributes::ExecutionStarted {
                name: "test".to_string(),
                inputs: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_create_assigns_first_sequence_id() {
        let backend = InMemoryBackend::new();
        let instance = WorkflowInstance::new("i-1", "e-1");
        backend
            .create_workflow_instance(WorkflowEvent {
                instance: instance.clone(),
                event: started_event(),
            })
            .await
            .unwrap();

        let history = backend
            .get_workflow_instance_history(&instance, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sequence_id, 1);
        assert_eq!(history[0].event_type(), EventType::ExecutionStarted);
    }

    #[tokio::test]
    async fn test_future_event_promoted_when_due() {
        let backend = InMemoryBackend::new();
        let instance = WorkflowInstance::new("i-1", "e-1");
        backend
            .create_workflow_instance(WorkflowEvent {
                instance: instance.clone(),
                event: started_event(),
            })
            .await
            .unwrap();

        let task = backend
            .get_workflow_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        // Checkpoint a timer: self-addressed TimerFired parked in the
        // future-event index until its visibility time passes.
        let fired = Event::new(Utc::now(), EventAttributes::TimerFired)
            .with_visible_at(Utc::now() + chrono::Duration::milliseconds(50));
        backend
            .complete_workflow_task(
                &task,
                &instance,
                WorkflowState::Active,
                vec![Event::new(Utc::now(), EventAttributes::TaskStarted)],
                vec![],
                vec![WorkflowEvent {
                    instance: instance.clone(),
                    event: fired.clone(),
                }],
            )
            .await
            .unwrap();

        let task = backend
            .get_workflow_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.new_events.last().unwrap().id, fired.id);
    }

    #[tokio::test]
    async fn test_extend_unknown_task_is_lease_lost() {
        let backend = InMemoryBackend::new();
        let instance = WorkflowInstance::new("i-1", "e-1");
        let err = backend
            .extend_workflow_task("no-such-task", &instance)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::LeaseLost));
    }
}
