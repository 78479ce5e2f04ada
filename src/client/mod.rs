//! Client surface: create, signal, cancel and await workflow instances.

use crate::core::{
    from_payload, to_payload, Clock, CoreError, Event, EventAttributes, IntoInputs, SystemClock,
    WorkflowEvent, WorkflowInstance, WorkflowState,
};
use crate::storage::{Backend, BackendError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Granularity of the state poll inside [`Client::wait_for_workflow_instance`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Client layer error type.
///
/// `Canceled` and `Terminated` are typed sentinels so callers can
/// distinguish these outcomes from ordinary failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The workflow was canceled before producing a result.
    #[error("workflow canceled")]
    Canceled,

    /// The workflow was terminated by an operator.
    #[error("workflow terminated")]
    Terminated,

    /// The workflow did not reach a terminal state within the timeout.
    #[error("workflow did not finish in time")]
    Timeout,

    /// The workflow function returned an error.
    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    /// The instance finished but its history carries no result event.
    #[error("workflow finished without a result event")]
    MissingResult,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Options for creating a workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowInstanceOptions {
    /// User-supplied id uniquely identifying the logical workflow.
    pub instance_id: String,
}

/// Façade over a [`Backend`] for starting and observing workflows.
pub struct Client<B> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> Client<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
        }
    }

    /// Starts a new workflow instance running the named workflow function.
    pub async fn create_workflow_instance(
        &self,
        options: WorkflowInstanceOptions,
        workflow: impl Into<String>,
        args: impl IntoInputs,
    ) -> Result<WorkflowInstance, ClientError> {
        let inputs = args.into_inputs()?;
        let started = Event::new(
            self.clock.now(),
            EventAttributes::ExecutionStarted {
                name: workflow.into(),
                inputs,
            },
        );
        let instance = WorkflowInstance::new(options.instance_id, Uuid::new_v4().to_string());

        self.backend
            .create_workflow_instance(WorkflowEvent {
                instance: instance.clone(),
                event: started,
            })
            .await?;

        debug!(instance = %instance, "created workflow instance");
        Ok(instance)
    }

    /// Requests cancellation of a running workflow instance.
    pub async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), ClientError> {
        let event = Event::new(self.clock.now(), EventAttributes::ExecutionCanceled);
        self.backend
            .cancel_workflow_instance(instance, event)
            .await?;
        debug!(instance = %instance, "requested workflow cancellation");
        Ok(())
    }

    /// Delivers a named signal to the instance's current execution.
    pub async fn signal_workflow(
        &self,
        instance_id: &str,
        name: impl Into<String>,
        arg: impl Serialize,
    ) -> Result<(), ClientError> {
        let arg = to_payload(&arg)?;
        let event = Event::new(
            self.clock.now(),
            EventAttributes::SignalReceived {
                name: name.into(),
                arg: Some(arg),
            },
        );
        self.backend.signal_workflow(instance_id, event).await?;
        debug!(instance_id = %instance_id, "signaled workflow instance");
        Ok(())
    }

    /// Waits until the instance reaches a terminal state, polling the
    /// backend, or fails with [`ClientError::Timeout`].
    pub async fn wait_for_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.backend.get_workflow_instance_state(instance).await?;
            if state == WorkflowState::Finished {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Waits for the instance to finish and decodes its result.
    ///
    /// Returns the typed result on completion, [`ClientError::Canceled`] or
    /// [`ClientError::Terminated`] for those terminal states, and
    /// [`ClientError::WorkflowFailed`] carrying the workflow's error.
    pub async fn get_workflow_result<T: DeserializeOwned>(
        &self,
        instance: &WorkflowInstance,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        self.wait_for_workflow_instance(instance, timeout).await?;

        let history = self
            .backend
            .get_workflow_instance_history(instance, None)
            .await?;

        // The terminal event sits at the tail; scan backwards.
        for event in history.iter().rev() {
            match &event.attributes {
                EventAttributes::ExecutionFinished { result, error } => {
                    if let Some(error) = error {
                        return Err(ClientError::WorkflowFailed(error.clone()));
                    }
                    let payload = result.as_ref().ok_or(ClientError::MissingResult)?;
                    return Ok(from_payload(payload)?);
                }
                EventAttributes::ExecutionCanceled => return Err(ClientError::Canceled),
                EventAttributes::ExecutionTerminated => return Err(ClientError::Terminated),
                _ => {}
            }
        }

        Err(ClientError::MissingResult)
    }
}
