//! Deterministic workflow replay.
//!
//! The executor drives the registered workflow function against a
//! materialized event list. Replay is purely computational: the workflow
//! future is polled once per task with a no-op waker, resolving any futures
//! whose completion events have arrived and collecting the scheduling
//! commands recorded during the poll. Progress only becomes durable when
//! the worker checkpoints the returned [`ExecutionResult`].

use super::context::{Command, WorkflowContext};
use super::registry::{Registry, WorkflowInvokeFuture};
use crate::core::{
    Clock, Event, EventAttributes, EventType, WorkflowEvent, WorkflowInstance, WorkflowTask,
};
use crate::executor::ExecutionError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use tracing::debug;

/// Output of a single workflow task execution.
///
/// `executed` is the ordered batch to append to the instance's history,
/// beginning with a `TaskStarted` marker; `activity_events` is the subset
/// that schedules activities; `workflow_events` are cross-instance messages;
/// `completed` reports that the instance reached a terminal state.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub executed: Vec<Event>,
    pub activity_events: Vec<Event>,
    pub workflow_events: Vec<WorkflowEvent>,
    pub completed: bool,
}

/// Per-instance deterministic replayer.
///
/// A fresh executor is seeded with the task's persisted history (cold
/// replay); a cached executor retains its advanced workflow future and is
/// driven by just the new events of each subsequent task.
pub struct WorkflowExecutor {
    instance: WorkflowInstance,
    registry: Arc<RwLock<Registry>>,
    clock: Arc<dyn Clock>,
    ctx: WorkflowContext,
    workflow: Option<WorkflowInvokeFuture>,
    finished: bool,
}

impl WorkflowExecutor {
    /// Creates a cold executor from the instance's persisted history.
    pub fn new(
        instance: WorkflowInstance,
        registry: Arc<RwLock<Registry>>,
        clock: Arc<dyn Clock>,
        history: Vec<Event>,
    ) -> Self {
        let now = clock.now();
        let ctx = WorkflowContext::new(instance.clone(), history, now);
        Self {
            instance,
            registry,
            clock,
            ctx,
            workflow: None,
            finished: false,
        }
    }

    /// Replays the task's new events and advances the workflow function.
    pub fn execute_task(&mut self, task: &WorkflowTask) -> ExecutionResult {
        let now = self.clock.now();
        self.ctx.set_now(now);

        let mut result = ExecutionResult {
            executed: vec![Event::new(now, EventAttributes::TaskStarted)],
            ..Default::default()
        };

        for event in &task.new_events {
            if event.event_type() == EventType::ExecutionCanceled {
                self.ctx.set_canceled();
            }
            self.ctx.append_event(event.clone());
            result.executed.push(event.clone());
        }

        if self.finished {
            // Nothing more can happen after a terminal event; events that
            // still arrive are recorded and the backend drops the rest.
            result.completed = true;
            return result;
        }

        if self.ctx.is_canceled() {
            self.cancel(&mut result);
            return result;
        }

        if self.workflow.is_none() {
            if let Err(error) = self.instantiate_workflow() {
                self.finish_with_error(&mut result, now, error);
                return result;
            }
        }

        let outcome = match self.workflow.as_mut() {
            Some(workflow) => poll_once(workflow),
            None => Poll::Pending,
        };
        self.drain_commands(&mut result);

        match outcome {
            Poll::Ready(Ok(payload)) => {
                debug!(instance = %self.instance, "workflow completed");
                self.finished = true;
                result.completed = true;
                let finished = Event::new(
                    self.clock.now(),
                    EventAttributes::ExecutionFinished {
                        result: payload.clone(),
                        error: None,
                    },
                );
                result.executed.push(finished);
                self.notify_parent(&mut result, payload, None);
            }
            Poll::Ready(Err(error)) => {
                debug!(instance = %self.instance, error = %error, "workflow failed");
                self.finish_with_error(&mut result, now, error);
            }
            Poll::Pending => {
                // Suspended: every outstanding future is waiting for events
                // a later task will deliver.
            }
        }

        result
    }

    fn instantiate_workflow(&mut self) -> Result<(), String> {
        let (name, inputs) = self
            .ctx
            .execution_started()
            .ok_or_else(|| "history has no ExecutionStarted event".to_string())?;

        // Clone the handler out so the registry lock is not held while the
        // workflow runs.
        let handler = {
            let registry = self.registry.read().unwrap();
            registry.workflow_handler(&name)
        };

        match handler {
            Some(handler) => {
                self.workflow = Some(handler(self.ctx.clone(), inputs));
                Ok(())
            }
            None => Err(ExecutionError::WorkflowNotFound(name).to_string()),
        }
    }

    fn finish_with_error(
        &mut self,
        result: &mut ExecutionResult,
        now: chrono::DateTime<chrono::Utc>,
        error: String,
    ) {
        self.finished = true;
        result.completed = true;
        result.executed.push(Event::new(
            now,
            EventAttributes::ExecutionFinished {
                result: None,
                error: Some(error.clone()),
            },
        ));
        self.notify_parent(result, None, Some(error));
    }

    /// Terminates a canceled instance: requests cancellation of every open
    /// sub-workflow and reports cancellation to the parent, if any.
    fn cancel(&mut self, result: &mut ExecutionResult) {
        let now = self.clock.now();
        self.finished = true;
        result.completed = true;

        for (schedule_event_id, child_id) in self.ctx.open_sub_workflows() {
            result.executed.push(
                Event::new(
                    now,
                    EventAttributes::SubWorkflowCancellationRequested {
                        instance_id: child_id.clone(),
                    },
                )
                .with_schedule_event_id(schedule_event_id),
            );
            result.workflow_events.push(WorkflowEvent {
                instance: WorkflowInstance::new(child_id, ""),
                event: Event::new(now, EventAttributes::ExecutionCanceled),
            });
        }

        self.notify_parent(result, None, Some("sub-workflow canceled".to_string()));
    }

    fn notify_parent(
        &self,
        result: &mut ExecutionResult,
        payload: Option<crate::core::Payload>,
        error: Option<String>,
    ) {
        let Some(parent) = &self.instance.parent else {
            return;
        };
        let completed = Event::new(
            self.clock.now(),
            EventAttributes::SubWorkflowCompleted {
                result: payload,
                error,
            },
        )
        .with_schedule_event_id(parent.schedule_event_id);
        result.workflow_events.push(WorkflowEvent {
            instance: WorkflowInstance::new(parent.instance_id.clone(), ""),
            event: completed,
        });
    }

    fn drain_commands(&mut self, result: &mut ExecutionResult) {
        for command in self.ctx.take_commands() {
            match command {
                Command::ScheduleActivity(event) => {
                    result.executed.push(event.clone());
                    result.activity_events.push(event);
                }
                Command::ScheduleTimer { scheduled, fired } => {
                    result.executed.push(scheduled);
                    result.workflow_events.push(WorkflowEvent {
                        instance: self.instance.clone(),
                        event: fired,
                    });
                }
                Command::ScheduleSubWorkflow {
                    scheduled,
                    child,
                    started,
                } => {
                    result.executed.push(scheduled);
                    result.workflow_events.push(WorkflowEvent {
                        instance: child,
                        event: started,
                    });
                }
            }
        }
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Polls a workflow future exactly once against the materialized events.
/// The waker is inert: workflow code must never wait on real I/O.
fn poll_once<O>(future: &mut Pin<Box<dyn Future<Output = O> + Send>>) -> Poll<O> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    future.as_mut().poll(&mut cx)
}
