//! Replay-safe workflow context.
//!
//! Workflow functions receive a [`WorkflowContext`] and schedule operations
//! through it. Each scheduling call either adopts the matching unclaimed
//! scheduled event from history (replay) or appends a fresh scheduled event
//! and records a command for the executor to materialize (live execution).
//! The returned futures resolve by correlating completion events'
//! `schedule_event_id` against the scheduled event's id, so replaying an
//! identical history reconstructs identical decisions.

use crate::core::{
    from_payload, Event, EventAttributes, EventType, IntoInputs, Payload, WorkflowInstance,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use uuid::Uuid;

/// A scheduling decision produced during a poll, drained by the executor.
#[derive(Debug)]
pub(crate) enum Command {
    /// Enqueue an activity; the event is the `ActivityScheduled` entry.
    ScheduleActivity(Event),
    /// Record a timer and deliver a self-addressed `TimerFired` once
    /// `visible_at` passes.
    ScheduleTimer { scheduled: Event, fired: Event },
    /// Record a sub-workflow and start the child instance.
    ScheduleSubWorkflow {
        scheduled: Event,
        child: WorkflowInstance,
        started: Event,
    },
}

struct ContextInner {
    events: Vec<Event>,
    claimed: HashSet<Uuid>,
    consumed_signals: HashSet<Uuid>,
    commands: Vec<Command>,
    canceled: bool,
    // Task-start time; stable for the whole poll so decisions replay
    // identically.
    now: DateTime<Utc>,
}

/// Handle through which workflow functions schedule activities, timers,
/// signal waits, and sub-workflows.
///
/// Cloning is cheap; all clones share the same replay state.
#[derive(Clone)]
pub struct WorkflowContext {
    instance: WorkflowInstance,
    inner: Arc<Mutex<ContextInner>>,
}

impl WorkflowContext {
    pub(crate) fn new(instance: WorkflowInstance, history: Vec<Event>, now: DateTime<Utc>) -> Self {
        Self {
            instance,
            inner: Arc::new(Mutex::new(ContextInner {
                events: history,
                claimed: HashSet::new(),
                consumed_signals: HashSet::new(),
                commands: Vec::new(),
                canceled: false,
                now,
            })),
        }
    }

    /// The workflow instance this context belongs to.
    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    /// Deterministic current time: the timestamp of the running task.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    /// Whether cancellation has been delivered to this instance.
    pub fn is_canceled(&self) -> bool {
        self.inner.lock().unwrap().canceled
    }

    pub(crate) fn set_now(&self, now: DateTime<Utc>) {
        self.inner.lock().unwrap().now = now;
    }

    pub(crate) fn set_canceled(&self) {
        self.inner.lock().unwrap().canceled = true;
    }

    pub(crate) fn append_event(&self, event: Event) {
        self.inner.lock().unwrap().events.push(event);
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.inner.lock().unwrap().commands)
    }

    /// First `ExecutionStarted` entry, carrying workflow name and inputs.
    pub(crate) fn execution_started(&self) -> Option<(String, Vec<Payload>)> {
        let inner = self.inner.lock().unwrap();
        inner.events.iter().find_map(|e| match &e.attributes {
            EventAttributes::ExecutionStarted { name, inputs } => {
                Some((name.clone(), inputs.clone()))
            }
            _ => None,
        })
    }

    /// Ids of sub-workflows that were scheduled but have not completed,
    /// with their child instance ids. Used for cancellation propagation.
    pub(crate) fn open_sub_workflows(&self) -> Vec<(Uuid, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .events
            .iter()
            .filter_map(|e| match &e.attributes {
                EventAttributes::SubWorkflowScheduled { instance_id, .. } => {
                    Some((e.id, instance_id.clone()))
                }
                _ => None,
            })
            .filter(|(id, _)| {
                !inner.events.iter().any(|e| {
                    e.event_type() == EventType::SubWorkflowCompleted
                        && e.schedule_event_id == Some(*id)
                })
            })
            .collect()
    }

    /// Schedules an activity by name. The future resolves with the decoded
    /// activity result, or an error string for `ActivityFailed`.
    pub fn schedule_activity<T: DeserializeOwned>(
        &self,
        name: impl Into<String>,
        args: impl IntoInputs,
    ) -> ActivityFuture<T> {
        let name = name.into();
        let inputs = match args.into_inputs() {
            Ok(inputs) => inputs,
            Err(e) => {
                return ActivityFuture {
                    ctx: self.clone(),
                    schedule_event_id: Uuid::nil(),
                    poisoned: Some(format!("converting activity inputs: {}", e)),
                    _marker: PhantomData,
                }
            }
        };

        let mut inner = self.inner.lock().unwrap();
        let adopted = inner.events.iter().find_map(|e| match &e.attributes {
            EventAttributes::ActivityScheduled { name: n, .. }
                if *n == name && !inner.claimed.contains(&e.id) =>
            {
                Some(e.id)
            }
            _ => None,
        });

        let id = match adopted {
            Some(id) => id,
            None => {
                let event = Event::new(
                    inner.now,
                    EventAttributes::ActivityScheduled { name, inputs },
                );
                let id = event.id;
                inner.events.push(event.clone());
                inner.commands.push(Command::ScheduleActivity(event));
                id
            }
        };
        inner.claimed.insert(id);

        ActivityFuture {
            ctx: self.clone(),
            schedule_event_id: id,
            poisoned: None,
            _marker: PhantomData,
        }
    }

    /// Schedules a durable timer. The future resolves once the backend
    /// delivers the corresponding `TimerFired` event.
    pub fn schedule_timer(&self, delay: Duration) -> TimerFuture {
        let mut inner = self.inner.lock().unwrap();
        let adopted = inner.events.iter().find_map(|e| {
            (e.event_type() == EventType::TimerScheduled && !inner.claimed.contains(&e.id))
                .then_some(e.id)
        });

        let id = match adopted {
            Some(id) => id,
            None => {
                let fire_at = inner.now
                    + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
                let scheduled =
                    Event::new(inner.now, EventAttributes::TimerScheduled { fire_at });
                let id = scheduled.id;
                let fired = Event::new(inner.now, EventAttributes::TimerFired)
                    .with_schedule_event_id(id)
                    .with_visible_at(fire_at);
                inner.events.push(scheduled.clone());
                inner
                    .commands
                    .push(Command::ScheduleTimer { scheduled, fired });
                id
            }
        };
        inner.claimed.insert(id);

        TimerFuture {
            ctx: self.clone(),
            schedule_event_id: id,
        }
    }

    /// Waits for a named signal. The future resolves with the decoded
    /// signal argument.
    pub fn wait_for_signal<T: DeserializeOwned>(
        &self,
        name: impl Into<String>,
    ) -> SignalFuture<T> {
        SignalFuture {
            ctx: self.clone(),
            name: name.into(),
            _marker: PhantomData,
        }
    }

    /// Schedules a sub-workflow under the given child instance id. The
    /// future resolves when the child's completion is routed back.
    pub fn schedule_sub_workflow<T: DeserializeOwned>(
        &self,
        name: impl Into<String>,
        instance_id: impl Into<String>,
        args: impl IntoInputs,
    ) -> SubWorkflowFuture<T> {
        let name = name.into();
        let instance_id = instance_id.into();
        let inputs = match args.into_inputs() {
            Ok(inputs) => inputs,
            Err(e) => {
                return SubWorkflowFuture {
                    ctx: self.clone(),
                    schedule_event_id: Uuid::nil(),
                    poisoned: Some(format!("converting sub-workflow inputs: {}", e)),
                    _marker: PhantomData,
                }
            }
        };

        let mut inner = self.inner.lock().unwrap();
        let adopted = inner.events.iter().find_map(|e| match &e.attributes {
            EventAttributes::SubWorkflowScheduled {
                name: n,
                instance_id: child,
                ..
            } if *n == name && *child == instance_id && !inner.claimed.contains(&e.id) => {
                Some(e.id)
            }
            _ => None,
        });

        let id = match adopted {
            Some(id) => id,
            None => {
                let scheduled = Event::new(
                    inner.now,
                    EventAttributes::SubWorkflowScheduled {
                        name: name.clone(),
                        instance_id: instance_id.clone(),
                        inputs: inputs.clone(),
                    },
                );
                let id = scheduled.id;
                let child = WorkflowInstance::new_sub_workflow(
                    instance_id,
                    Uuid::new_v4().to_string(),
                    self.instance.instance_id.clone(),
                    id,
                );
                let started = Event::new(
                    inner.now,
                    EventAttributes::ExecutionStarted { name, inputs },
                );
                inner.events.push(scheduled.clone());
                inner.commands.push(Command::ScheduleSubWorkflow {
                    scheduled,
                    child,
                    started,
                });
                id
            }
        };
        inner.claimed.insert(id);

        SubWorkflowFuture {
            ctx: self.clone(),
            schedule_event_id: id,
            poisoned: None,
            _marker: PhantomData,
        }
    }
}

fn decode_result<T: DeserializeOwned>(result: &Option<Payload>) -> Result<T, String> {
    match result {
        Some(payload) => from_payload(payload).map_err(|e| format!("decoding result: {}", e)),
        None => from_payload(b"null").map_err(|e| format!("decoding empty result: {}", e)),
    }
}

/// Resolves with the result of a scheduled activity.
pub struct ActivityFuture<T> {
    ctx: WorkflowContext,
    schedule_event_id: Uuid,
    poisoned: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future for ActivityFuture<T> {
    type Output = Result<T, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(reason) = this.poisoned.take() {
            return Poll::Ready(Err(reason));
        }

        let inner = this.ctx.inner.lock().unwrap();
        for event in &inner.events {
            if event.schedule_event_id != Some(this.schedule_event_id) {
                continue;
            }
            match &event.attributes {
                EventAttributes::ActivityCompleted { result } => {
                    return Poll::Ready(decode_result(result));
                }
                EventAttributes::ActivityFailed { reason } => {
                    return Poll::Ready(Err(reason.clone()));
                }
                _ => {}
            }
        }
        Poll::Pending
    }
}

/// Resolves once the corresponding `TimerFired` event is delivered.
pub struct TimerFuture {
    ctx: WorkflowContext,
    schedule_event_id: Uuid,
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = this.ctx.inner.lock().unwrap();
        let fired = inner.events.iter().any(|e| {
            e.event_type() == EventType::TimerFired
                && e.schedule_event_id == Some(this.schedule_event_id)
        });
        if fired {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Resolves with the argument of the next unconsumed matching signal.
pub struct SignalFuture<T> {
    ctx: WorkflowContext,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future for SignalFuture<T> {
    type Output = Result<T, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();
        let found = inner.events.iter().find_map(|e| match &e.attributes {
            EventAttributes::SignalReceived { name, arg }
                if *name == this.name && !inner.consumed_signals.contains(&e.id) =>
            {
                Some((e.id, arg.clone()))
            }
            _ => None,
        });
        match found {
            Some((id, arg)) => {
                inner.consumed_signals.insert(id);
                Poll::Ready(decode_result(&arg))
            }
            None => Poll::Pending,
        }
    }
}

/// Resolves with the routed completion of a sub-workflow.
pub struct SubWorkflowFuture<T> {
    ctx: WorkflowContext,
    schedule_event_id: Uuid,
    poisoned: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future for SubWorkflowFuture<T> {
    type Output = Result<T, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(reason) = this.poisoned.take() {
            return Poll::Ready(Err(reason));
        }

        let inner = this.ctx.inner.lock().unwrap();
        for event in &inner.events {
            if event.schedule_event_id != Some(this.schedule_event_id) {
                continue;
            }
            if let EventAttributes::SubWorkflowCompleted { result, error } = &event.attributes {
                return match error {
                    Some(reason) => Poll::Ready(Err(reason.clone())),
                    None => Poll::Ready(decode_result(result)),
                };
            }
        }
        Poll::Pending
    }
}
