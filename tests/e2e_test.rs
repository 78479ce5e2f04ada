//! End-to-end scenarios: client + worker over the in-memory backend.

use praxis::client::{Client, ClientError, WorkflowInstanceOptions};
use praxis::core::{EventType, WorkflowState};
use praxis::executor::ActivityContext;
use praxis::storage::{Backend, InMemoryBackend};
use praxis::worker::{Worker, WorkerHandle};
use praxis::WorkflowContext;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    backend: Arc<InMemoryBackend>,
    client: Client<InMemoryBackend>,
    handle: WorkerHandle,
}

fn setup(register: impl FnOnce(&Worker<InMemoryBackend>)) -> Harness {
    let backend = Arc::new(InMemoryBackend::new());
    let worker = Worker::new(backend.clone());
    register(&worker);
    let handle = worker.start();
    Harness {
        backend: backend.clone(),
        client: Client::new(backend),
        handle,
    }
}

fn options() -> WorkflowInstanceOptions {
    WorkflowInstanceOptions {
        instance_id: Uuid::new_v4().to_string(),
    }
}

#[tokio::test]
async fn simple_workflow() {
    async fn hello(_ctx: WorkflowContext, msg: String) -> Result<String, String> {
        Ok(msg + " world")
    }

    let h = setup(|w| {
        w.register_workflow("hello", hello).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "hello", ("hello".to_string(),))
        .await
        .unwrap();

    let output: String = h
        .client
        .get_workflow_result(&instance, RESULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "hello world");

    h.handle.shutdown().await;
}

#[tokio::test]
async fn unregistered_workflow() {
    let h = setup(|_| {});

    let instance = h
        .client
        .create_workflow_instance(options(), "missing", ("hello".to_string(),))
        .await
        .unwrap();

    let err = h
        .client
        .get_workflow_result::<String>(&instance, RESULT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "got: {}", err);

    let state = h
        .backend
        .get_workflow_instance_state(&instance)
        .await
        .unwrap();
    assert_eq!(state, WorkflowState::Finished);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn workflow_argument_mismatch() {
    async fn answer(_ctx: WorkflowContext, _p: i64) -> Result<i64, String> {
        Ok(42)
    }

    let h = setup(|w| {
        w.register_workflow("answer", answer).unwrap();
    });

    // Started with no arguments at all.
    let instance = h
        .client
        .create_workflow_instance(options(), "answer", ())
        .await
        .unwrap();

    let err = h
        .client
        .get_workflow_result::<i64>(&instance, RESULT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("mismatched argument count: expected 1, got 0"),
        "got: {}",
        err
    );

    // The failed conversion never scheduled an activity.
    let activity = h
        .backend
        .get_activity_task(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(activity.is_none());

    h.handle.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity() {
    async fn calls_missing(ctx: WorkflowContext) -> Result<i64, String> {
        ctx.schedule_activity::<i64>("missing-activity", ()).await
    }

    let h = setup(|w| {
        w.register_workflow("calls-missing", calls_missing).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "calls-missing", ())
        .await
        .unwrap();

    let err = h
        .client
        .get_workflow_result::<i64>(&instance, RESULT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("activity not found"), "got: {}", err);

    // The failure is recorded in the history as ActivityFailed.
    let history = h
        .backend
        .get_workflow_instance_history(&instance, None)
        .await
        .unwrap();
    assert!(history
        .iter()
        .any(|e| e.event_type() == EventType::ActivityFailed));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn activity_results_resolve_futures() {
    async fn add(_ctx: ActivityContext, a: i64, b: i64) -> Result<i64, String> {
        Ok(a + b)
    }

    async fn adder(ctx: WorkflowContext, a: i64, b: i64) -> Result<i64, String> {
        let first = ctx.schedule_activity::<i64>("add", (a, b)).await?;
        let second = ctx.schedule_activity::<i64>("add", (first, 1)).await?;
        Ok(second)
    }

    let h = setup(|w| {
        w.register_workflow("adder", adder).unwrap();
        w.register_activity("add", add).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "adder", (20, 21))
        .await
        .unwrap();

    let output: i64 = h
        .client
        .get_workflow_result(&instance, RESULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, 42);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn timer_fires_and_workflow_resumes() {
    async fn sleeper(ctx: WorkflowContext) -> Result<String, String> {
        ctx.schedule_timer(Duration::from_millis(50)).await;
        Ok("woke up".to_string())
    }

    let h = setup(|w| {
        w.register_workflow("sleeper", sleeper).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "sleeper", ())
        .await
        .unwrap();

    let output: String = h
        .client
        .get_workflow_result(&instance, RESULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "woke up");

    let history = h
        .backend
        .get_workflow_instance_history(&instance, None)
        .await
        .unwrap();
    assert!(history
        .iter()
        .any(|e| e.event_type() == EventType::TimerScheduled));
    assert!(history
        .iter()
        .any(|e| e.event_type() == EventType::TimerFired));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn signal_delivers_argument() {
    async fn waiter(ctx: WorkflowContext) -> Result<String, String> {
        ctx.wait_for_signal::<String>("go").await
    }

    let h = setup(|w| {
        w.register_workflow("waiter", waiter).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "waiter", ())
        .await
        .unwrap();

    // Give the first task a moment so the signal lands in a later one.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.client
        .signal_workflow(&instance.instance_id, "go", "green".to_string())
        .await
        .unwrap();

    let output: String = h
        .client
        .get_workflow_result(&instance, RESULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "green");

    h.handle.shutdown().await;
}

#[tokio::test]
async fn sub_workflow_completion_routes_to_parent() {
    async fn child(_ctx: WorkflowContext, msg: String) -> Result<String, String> {
        Ok(format!("child says {}", msg))
    }

    async fn parent(ctx: WorkflowContext) -> Result<String, String> {
        let child_id = format!("{}-child", ctx.instance().instance_id);
        ctx.schedule_sub_workflow::<String>("child", child_id, ("hi".to_string(),))
            .await
    }

    let h = setup(|w| {
        w.register_workflow("parent", parent).unwrap();
        w.register_workflow("child", child).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "parent", ())
        .await
        .unwrap();

    let output: String = h
        .client
        .get_workflow_result(&instance, RESULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "child says hi");

    let history = h
        .backend
        .get_workflow_instance_history(&instance, None)
        .await
        .unwrap();
    assert!(history
        .iter()
        .any(|e| e.event_type() == EventType::SubWorkflowScheduled));
    assert!(history
        .iter()
        .any(|e| e.event_type() == EventType::SubWorkflowCompleted));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn canceled_workflow_returns_sentinel() {
    async fn blocked(ctx: WorkflowContext) -> Result<String, String> {
        ctx.wait_for_signal::<String>("never").await
    }

    let h = setup(|w| {
        w.register_workflow("blocked", blocked).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "blocked", ())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.client.cancel_workflow_instance(&instance).await.unwrap();

    let err = h
        .client
        .get_workflow_result::<String>(&instance, RESULT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Canceled));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn workflow_error_surfaces_to_client() {
    async fn failing(_ctx: WorkflowContext) -> Result<String, String> {
        Err("deliberate failure".to_string())
    }

    let h = setup(|w| {
        w.register_workflow("failing", failing).unwrap();
    });

    let instance = h
        .client
        .create_workflow_instance(options(), "failing", ())
        .await
        .unwrap();

    let err = h
        .client
        .get_workflow_result::<String>(&instance, RESULT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("deliberate failure"), "got: {}", err);

    h.handle.shutdown().await;
}
