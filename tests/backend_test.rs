//! Backend contract tests over the in-memory reference implementation.

use chrono::Utc;
use praxis::core::{
    Event, EventAttributes, EventType, WorkflowEvent, WorkflowInstance, WorkflowState,
    WorkflowTask,
};
use praxis::storage::{Backend, BackendError, InMemoryBackend, MemoryBackendOptions};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn started_event(name: &str) -> Event {
    Event::new(
        Utc::now(),
        EventAttributes::ExecutionStarted {
            name: name.to_string(),
            inputs: vec![],
        },
    )
}

fn new_instance() -> WorkflowInstance {
    WorkflowInstance::new(Uuid::new_v4().to_string(), Uuid::new_v4().to_string())
}

async fn create_instance(backend: &InMemoryBackend, instance: &WorkflowInstance) {
    backend
        .create_workflow_instance(WorkflowEvent {
            instance: instance.clone(),
            event: started_event("test-workflow"),
        })
        .await
        .unwrap();
}

/// Creates an instance and consumes its initial workflow task.
async fn start_and_drain(backend: &InMemoryBackend, instance: &WorkflowInstance) {
    create_instance(backend, instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.instance.instance_id, instance.instance_id);

    backend
        .complete_workflow_task(
            &task,
            instance,
            WorkflowState::Active,
            vec![Event::new(Utc::now(), EventAttributes::TaskStarted)],
            vec![],
            vec![],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn get_workflow_task_returns_none_on_timeout() {
    let backend = InMemoryBackend::new();
    let task = backend
        .get_workflow_task(Duration::from_millis(10))
        .await
        .unwrap();
    assert!(task.is_none());
}

#[tokio::test]
async fn get_activity_task_returns_none_on_timeout() {
    let backend = InMemoryBackend::new();
    let task = backend
        .get_activity_task(Duration::from_millis(10))
        .await
        .unwrap();
    assert!(task.is_none());
}

#[tokio::test]
async fn create_workflow_instance_does_not_error() {
    let backend = InMemoryBackend::new();
    create_instance(&backend, &new_instance()).await;
}

#[tokio::test]
async fn create_same_instance_errors() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let err = backend
        .create_workflow_instance(WorkflowEvent {
            instance: instance.clone(),
            event: started_event("test-workflow"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InstanceAlreadyExists));
}

#[tokio::test]
async fn get_workflow_task_returns_task() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.instance.instance_id, instance.instance_id);
    assert_eq!(task.history.len(), 1);
    assert_eq!(task.history[0].event_type(), EventType::ExecutionStarted);
    assert!(task.new_events.is_empty());
}

#[tokio::test]
async fn get_workflow_task_locks_task() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap();
    assert!(task.is_some());

    // The only task is leased; a second dequeue must time out.
    let task = backend
        .get_workflow_task(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(task.is_none());
}

#[tokio::test]
async fn complete_workflow_task_errors_without_lease() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let bogus = WorkflowTask {
        id: "not-a-lease".to_string(),
        instance: instance.clone(),
        history: vec![],
        new_events: vec![],
        last_pending_event_id: None,
    };
    let err = backend
        .complete_workflow_task(&bogus, &instance, WorkflowState::Active, vec![], vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::LeaseLost));
}

#[tokio::test]
async fn complete_workflow_task_rejects_mismatched_instance() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let other = new_instance();
    let err = backend
        .complete_workflow_task(&task, &other, WorkflowState::Active, vec![], vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InstanceMismatch));

    // The failed call must not have released the lease or touched history.
    let history = backend
        .get_workflow_instance_history(&instance, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn complete_workflow_task_appends_dense_history() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let scheduled = Event::new(
        Utc::now(),
        EventAttributes::ActivityScheduled {
            name: "a".to_string(),
            inputs: vec![],
        },
    );
    let executed = vec![
        Event::new(Utc::now(), EventAttributes::TaskStarted),
        scheduled.clone(),
    ];
    backend
        .complete_workflow_task(
            &task,
            &instance,
            WorkflowState::Active,
            executed.clone(),
            vec![scheduled.clone()],
            vec![],
        )
        .await
        .unwrap();

    let history = backend
        .get_workflow_instance_history(&instance, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    for pair in history.windows(2) {
        assert_eq!(pair[0].sequence_id + 1, pair[1].sequence_id);
    }
    assert_eq!(history[1].id, executed[0].id);
    assert_eq!(history[2].id, executed[1].id);

    // The suffix slice honors after_sequence_id.
    let suffix = backend
        .get_workflow_instance_history(&instance, Some(1))
        .await
        .unwrap();
    assert_eq!(suffix.len(), 2);

    // The scheduled activity is delivered on the activity queue.
    let activity = backend
        .get_activity_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(activity.event.id, scheduled.id);
}

#[tokio::test]
async fn signal_errors_when_instance_does_not_exist() {
    let backend = InMemoryBackend::new();
    let signal = Event::new(
        Utc::now(),
        EventAttributes::SignalReceived {
            name: "signal".to_string(),
            arg: None,
        },
    );
    let err = backend
        .signal_workflow("does-not-exist", signal)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InstanceNotFound));
}

#[tokio::test]
async fn cancel_errors_when_instance_does_not_exist() {
    let backend = InMemoryBackend::new();
    let err = backend
        .cancel_workflow_instance(
            &new_instance(),
            Event::new(Utc::now(), EventAttributes::ExecutionCanceled),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InstanceNotFound));
}

#[tokio::test]
async fn cancel_adds_cancel_event_to_pending() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    start_and_drain(&backend, &instance).await;

    backend
        .cancel_workflow_instance(
            &instance,
            Event::new(Utc::now(), EventAttributes::ExecutionCanceled),
        )
        .await
        .unwrap();

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        task.new_events.last().unwrap().event_type(),
        EventType::ExecutionCanceled
    );
}

#[tokio::test]
async fn complete_workflow_task_routes_instance_events() {
    let backend = InMemoryBackend::new();

    let sub_instance = WorkflowInstance::new_sub_workflow(
        Uuid::new_v4().to_string(),
        Uuid::new_v4().to_string(),
        "parent",
        Uuid::new_v4(),
    );
    start_and_drain(&backend, &sub_instance).await;

    let parent = new_instance();
    create_instance(&backend, &parent).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.instance.instance_id, parent.instance_id);

    backend
        .complete_workflow_task(
            &task,
            &parent,
            WorkflowState::Active,
            vec![Event::new(Utc::now(), EventAttributes::TaskStarted)],
            vec![],
            vec![WorkflowEvent {
                instance: sub_instance.clone(),
                event: Event::new(Utc::now(), EventAttributes::ExecutionCanceled),
            }],
        )
        .await
        .unwrap();

    // The routed cancellation produces a task for the sub-instance.
    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.instance.instance_id, sub_instance.instance_id);
    assert_eq!(
        task.new_events.last().unwrap().event_type(),
        EventType::ExecutionCanceled
    );
}

#[tokio::test]
async fn concurrent_signals_deliver_one_task() {
    let backend = Arc::new(InMemoryBackend::new());
    let instance = new_instance();
    start_and_drain(&backend, &instance).await;

    let mut joins = Vec::new();
    for i in 0..10 {
        let backend = backend.clone();
        let instance_id = instance.instance_id.clone();
        joins.push(tokio::spawn(async move {
            backend
                .signal_workflow(
                    &instance_id,
                    Event::new(
                        Utc::now(),
                        EventAttributes::SignalReceived {
                            name: format!("signal-{}", i),
                            arg: None,
                        },
                    ),
                )
                .await
                .unwrap();
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    // Exactly one task carrying all ten signal events.
    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.new_events.len(), 10);
    assert!(task
        .new_events
        .iter()
        .all(|e| e.event_type() == EventType::SignalReceived));

    let second = backend
        .get_workflow_task(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn expired_lease_redelivers_identical_task() {
    let backend = InMemoryBackend::with_options(
        MemoryBackendOptions::default().with_lease_timeout(Duration::from_millis(100)),
    );
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    // The holder slept past its lease: completion is rejected and nothing
    // becomes visible.
    let err = backend
        .complete_workflow_task(
            &task,
            &instance,
            WorkflowState::Active,
            vec![Event::new(Utc::now(), EventAttributes::TaskStarted)],
            vec![],
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::LeaseLost));

    let history = backend
        .get_workflow_instance_history(&instance, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    // The identical payload is redelivered to the next consumer.
    let redelivered = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.instance, task.instance);
    assert_eq!(redelivered.history.len(), task.history.len());
    assert_eq!(redelivered.new_events.len(), task.new_events.len());

    backend
        .complete_workflow_task(
            &redelivered,
            &instance,
            WorkflowState::Active,
            vec![Event::new(Utc::now(), EventAttributes::TaskStarted)],
            vec![],
            vec![],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn terminal_event_finishes_instance() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    backend
        .complete_workflow_task(
            &task,
            &instance,
            // A terminal event in the batch forces Finished even when the
            // caller passes Active.
            WorkflowState::Active,
            vec![
                Event::new(Utc::now(), EventAttributes::TaskStarted),
                Event::new(
                    Utc::now(),
                    EventAttributes::ExecutionFinished {
                        result: None,
                        error: None,
                    },
                ),
            ],
            vec![],
            vec![],
        )
        .await
        .unwrap();

    let state = backend
        .get_workflow_instance_state(&instance)
        .await
        .unwrap();
    assert_eq!(state, WorkflowState::Finished);

    let signal = Event::new(
        Utc::now(),
        EventAttributes::SignalReceived {
            name: "late".to_string(),
            arg: None,
        },
    );
    let err = backend
        .signal_workflow(&instance.instance_id, signal)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InstanceNotFound));
}

#[tokio::test]
async fn pending_events_survive_checkpoint_and_redeliver() {
    let backend = InMemoryBackend::new();
    let instance = new_instance();
    create_instance(&backend, &instance).await;

    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    // A signal arrives while the task is executing.
    backend
        .signal_workflow(
            &instance.instance_id,
            Event::new(
                Utc::now(),
                EventAttributes::SignalReceived {
                    name: "mid-flight".to_string(),
                    arg: None,
                },
            ),
        )
        .await
        .unwrap();

    backend
        .complete_workflow_task(
            &task,
            &instance,
            WorkflowState::Active,
            vec![Event::new(Utc::now(), EventAttributes::TaskStarted)],
            vec![],
            vec![],
        )
        .await
        .unwrap();

    // The undelivered signal triggers a follow-up task.
    let task = backend
        .get_workflow_task(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.new_events.len(), 1);
    assert_eq!(
        task.new_events[0].event_type(),
        EventType::SignalReceived
    );
}
