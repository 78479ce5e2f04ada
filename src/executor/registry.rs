//! Name-keyed registry for workflow and activity functions.
//!
//! Functions are erased into boxed async handlers at registration time.
//! Arity is captured by the `WorkflowFn`/`ActivityFn` impls so that input
//! conversion can reject a mismatched argument count with the exact shape
//! the caller supplied.

use super::context::WorkflowContext;
use super::error::ExecutionError;
use crate::core::{from_payload, to_payload, Payload, WorkflowInstance};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub(crate) type WorkflowInvokeFuture =
    Pin<Box<dyn Future<Output = Result<Option<Payload>, String>> + Send>>;

pub(crate) type BoxedWorkflow =
    Arc<dyn Fn(WorkflowContext, Vec<Payload>) -> WorkflowInvokeFuture + Send + Sync>;

pub(crate) type ActivityInvokeFuture =
    Pin<Box<dyn Future<Output = Result<Option<Payload>, String>> + Send>>;

pub(crate) type BoxedActivity =
    Arc<dyn Fn(ActivityContext, Vec<Payload>) -> ActivityInvokeFuture + Send + Sync>;

/// Context handed to activity functions.
///
/// Activities run real side effects; the context identifies which workflow
/// scheduled them, e.g. for logging or building idempotency keys.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: WorkflowInstance,
    pub schedule_event_id: Uuid,
}

impl ActivityContext {
    /// Deterministic key for external services that deduplicate work:
    /// stable across redeliveries of the same activity task.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.instance.instance_id, self.schedule_event_id)
    }
}

fn check_arity(what: &str, expected: usize, inputs: &[Payload]) -> Result<(), String> {
    if inputs.len() != expected {
        return Err(format!(
            "converting {} inputs: {}",
            what,
            ExecutionError::ArgumentMismatch {
                expected,
                got: inputs.len(),
            }
        ));
    }
    Ok(())
}

fn decode_arg<T: DeserializeOwned>(what: &str, payload: &Payload) -> Result<T, String> {
    from_payload(payload).map_err(|e| format!("converting {} inputs: {}", what, e))
}

fn encode_output<R: Serialize>(value: &R) -> Result<Option<Payload>, String> {
    to_payload(value)
        .map(Some)
        .map_err(|e| format!("converting result: {}", e))
}

/// A function registrable as a workflow.
///
/// Implemented for async functions taking a [`WorkflowContext`] and zero,
/// one or two deserializable arguments, returning `Result<R, E>`.
pub trait WorkflowFn<Args>: Send + Sync + 'static {
    fn into_handler(self) -> BoxedWorkflow;
}

impl<F, Fut, R, E> WorkflowFn<()> for F
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_handler(self) -> BoxedWorkflow {
        Arc::new(move |ctx, inputs| {
            let f = self.clone();
            Box::pin(async move {
                check_arity("workflow", 0, &inputs)?;
                match f(ctx).await {
                    Ok(value) => encode_output(&value),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }
}

impl<F, Fut, A, R, E> WorkflowFn<(A,)> for F
where
    F: Fn(WorkflowContext, A) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_handler(self) -> BoxedWorkflow {
        Arc::new(move |ctx, inputs| {
            let f = self.clone();
            Box::pin(async move {
                check_arity("workflow", 1, &inputs)?;
                let a = decode_arg("workflow", &inputs[0])?;
                match f(ctx, a).await {
                    Ok(value) => encode_output(&value),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }
}

impl<F, Fut, A, B, R, E> WorkflowFn<(A, B)> for F
where
    F: Fn(WorkflowContext, A, B) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    B: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_handler(self) -> BoxedWorkflow {
        Arc::new(move |ctx, inputs| {
            let f = self.clone();
            Box::pin(async move {
                check_arity("workflow", 2, &inputs)?;
                let a = decode_arg("workflow", &inputs[0])?;
                let b = decode_arg("workflow", &inputs[1])?;
                match f(ctx, a, b).await {
                    Ok(value) => encode_output(&value),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }
}

/// A function registrable as an activity.
///
/// Implemented for async functions taking an [`ActivityContext`] and zero,
/// one or two deserializable arguments, returning `Result<R, E>`.
pub trait ActivityFn<Args>: Send + Sync + 'static {
    fn into_handler(self) -> BoxedActivity;
}

impl<F, Fut, R, E> ActivityFn<()> for F
where
    F: Fn(ActivityContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_handler(self) -> BoxedActivity {
        Arc::new(move |ctx, inputs| {
            let f = self.clone();
            Box::pin(async move {
                check_arity("activity", 0, &inputs)?;
                match f(ctx).await {
                    Ok(value) => encode_output(&value),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }
}

impl<F, Fut, A, R, E> ActivityFn<(A,)> for F
where
    F: Fn(ActivityContext, A) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_handler(self) -> BoxedActivity {
        Arc::new(move |ctx, inputs| {
            let f = self.clone();
            Box::pin(async move {
                check_arity("activity", 1, &inputs)?;
                let a = decode_arg("activity", &inputs[0])?;
                match f(ctx, a).await {
                    Ok(value) => encode_output(&value),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }
}

impl<F, Fut, A, B, R, E> ActivityFn<(A, B)> for F
where
    F: Fn(ActivityContext, A, B) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    B: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_handler(self) -> BoxedActivity {
        Arc::new(move |ctx, inputs| {
            let f = self.clone();
            Box::pin(async move {
                check_arity("activity", 2, &inputs)?;
                let a = decode_arg("activity", &inputs[0])?;
                let b = decode_arg("activity", &inputs[1])?;
                match f(ctx, a, b).await {
                    Ok(value) => encode_output(&value),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }
}

/// Maps workflow and activity names to their erased handlers.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, BoxedWorkflow>,
    activities: HashMap<String, BoxedActivity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow function. Errors on a duplicate name.
    pub fn register_workflow<Args, W>(
        &mut self,
        name: impl Into<String>,
        workflow: W,
    ) -> Result<(), ExecutionError>
    where
        W: WorkflowFn<Args>,
    {
        let name = name.into();
        if self.workflows.contains_key(&name) {
            return Err(ExecutionError::DuplicateRegistration(name));
        }
        debug!(name = %name, "registered workflow");
        self.workflows.insert(name, workflow.into_handler());
        Ok(())
    }

    /// Registers an activity function. Errors on a duplicate name.
    pub fn register_activity<Args, A>(
        &mut self,
        name: impl Into<String>,
        activity: A,
    ) -> Result<(), ExecutionError>
    where
        A: ActivityFn<Args>,
    {
        let name = name.into();
        if self.activities.contains_key(&name) {
            return Err(ExecutionError::DuplicateRegistration(name));
        }
        debug!(name = %name, "registered activity");
        self.activities.insert(name, activity.into_handler());
        Ok(())
    }

    pub(crate) fn workflow_handler(&self, name: &str) -> Option<BoxedWorkflow> {
        self.workflows.get(name).cloned()
    }

    pub(crate) fn activity_handler(&self, name: &str) -> Option<BoxedActivity> {
        self.activities.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.workflows.len() + self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.activities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample(_ctx: WorkflowContext, msg: String) -> Result<String, String> {
        Ok(msg)
    }

    #[test]
    fn test_duplicate_workflow_rejected() {
        let mut registry = Registry::new();
        registry.register_workflow("sample", sample).unwrap();
        let err = registry.register_workflow("sample", sample).unwrap_err();
        assert!(matches!(err, ExecutionError::DuplicateRegistration(_)));
    }

    #[tokio::test]
    async fn test_argument_count_checked() {
        let mut registry = Registry::new();
        registry.register_workflow("sample", sample).unwrap();
        let handler = registry.workflow_handler("sample").unwrap();

        let instance = WorkflowInstance::new("i", "e");
        let ctx = WorkflowContext::new(instance, vec![], chrono::Utc::now());
        let err = handler(ctx, vec![]).await.unwrap_err();
        assert!(err.contains("mismatched argument count: expected 1, got 0"));
    }
}
