//! Worker: polls the backend for tasks and drives executors.
//!
//! Per task kind the worker runs a pool of pollers feeding a dispatcher
//! over an internal channel. The dispatcher spawns one handler per task,
//! bounded by an optional semaphore. Handlers obtain the workflow executor
//! through the cache, heartbeat long-running tasks, and checkpoint results
//! through the backend. Everything hangs off one root `CancellationToken`;
//! in-flight handlers drain on shutdown.

use crate::core::{
    ActivityTask, Clock, Event, EventAttributes, SystemClock, WorkflowState, WorkflowTask,
};
use crate::executor::{
    ActivityExecutor, ActivityFn, CacheOptions, ExecutionError, ExecutorCache, Registry,
    WorkflowExecutor, WorkflowFn,
};
use crate::storage::{Backend, BackendError};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Worker configuration.
///
/// The heartbeat interval must stay below half the backend's lease timeout
/// so a healthy handler never loses its lease.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of concurrent workflow task pollers.
    pub workflow_pollers: usize,
    /// Number of concurrent activity task pollers.
    pub activity_pollers: usize,
    /// Maximum workflow tasks processed in parallel; 0 means unbounded.
    pub max_parallel_workflow_tasks: usize,
    /// Maximum activity tasks processed in parallel; 0 means unbounded.
    pub max_parallel_activity_tasks: usize,
    /// Blocking dequeue timeout.
    pub poll_timeout: Duration,
    /// Lease extension period for in-flight tasks.
    pub heartbeat_interval: Duration,
    /// Whether workflow tasks are heartbeated while executing.
    pub heartbeat_workflow_tasks: bool,
    /// Executor cache tuning.
    pub cache: CacheOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workflow_pollers: 2,
            activity_pollers: 2,
            max_parallel_workflow_tasks: 0,
            max_parallel_activity_tasks: 0,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_workflow_tasks: true,
            cache: CacheOptions::default(),
        }
    }
}

struct WorkerInner<B> {
    backend: Arc<B>,
    registry: Arc<RwLock<Registry>>,
    cache: Arc<ExecutorCache>,
    clock: Arc<dyn Clock>,
    options: WorkerOptions,
}

/// Processes workflow and activity tasks from a backend.
///
/// Register functions first, then call [`Worker::start`]; the returned
/// [`WorkerHandle`] controls shutdown.
pub struct Worker<B: Backend + 'static> {
    inner: Arc<WorkerInner<B>>,
}

impl<B: Backend + 'static> Worker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_options(backend, WorkerOptions::default())
    }

    pub fn with_options(backend: Arc<B>, options: WorkerOptions) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                backend,
                registry: Arc::new(RwLock::new(Registry::new())),
                cache: Arc::new(ExecutorCache::new(options.cache.clone())),
                clock: Arc::new(SystemClock),
                options,
            }),
        }
    }

    /// Registers a workflow function under a name. Errors on duplicates.
    pub fn register_workflow<Args, W>(
        &self,
        name: impl Into<String>,
        workflow: W,
    ) -> Result<(), ExecutionError>
    where
        W: WorkflowFn<Args>,
    {
        self.inner
            .registry
            .write()
            .unwrap()
            .register_workflow(name, workflow)
    }

    /// Registers an activity function under a name. Errors on duplicates.
    pub fn register_activity<Args, A>(
        &self,
        name: impl Into<String>,
        activity: A,
    ) -> Result<(), ExecutionError>
    where
        A: ActivityFn<Args>,
    {
        self.inner
            .registry
            .write()
            .unwrap()
            .register_activity(name, activity)
    }

    /// Starts pollers, dispatchers and the cache eviction task.
    pub fn start(self) -> WorkerHandle {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let inner = self.inner;

        info!("starting worker");
        let handle = tokio::spawn(async move {
            let eviction = inner.cache.start_eviction(worker_token.child_token());

            let mut tasks: JoinSet<()> = JoinSet::new();

            let (workflow_tx, workflow_rx) = mpsc::channel::<WorkflowTask>(1);
            for _ in 0..inner.options.workflow_pollers.max(1) {
                tasks.spawn(workflow_poll_loop(
                    inner.clone(),
                    worker_token.clone(),
                    workflow_tx.clone(),
                ));
            }
            drop(workflow_tx);
            tasks.spawn(workflow_dispatcher(
                inner.clone(),
                worker_token.clone(),
                workflow_rx,
            ));

            let (activity_tx, activity_rx) = mpsc::channel::<ActivityTask>(1);
            for _ in 0..inner.options.activity_pollers.max(1) {
                tasks.spawn(activity_poll_loop(
                    inner.clone(),
                    worker_token.clone(),
                    activity_tx.clone(),
                ));
            }
            drop(activity_tx);
            tasks.spawn(activity_dispatcher(
                inner.clone(),
                worker_token.clone(),
                activity_rx,
            ));

            while tasks.join_next().await.is_some() {}
            let _ = eviction.await;
            info!("worker stopped");
        });

        WorkerHandle { token, handle }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Signals shutdown and waits for in-flight tasks to drain.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    /// Waits for the worker to finish after an external cancellation.
    pub async fn wait_for_completion(self) {
        let _ = self.handle.await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

async fn workflow_poll_loop<B: Backend>(
    inner: Arc<WorkerInner<B>>,
    token: CancellationToken,
    tx: mpsc::Sender<WorkflowTask>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = inner.backend.get_workflow_task(inner.options.poll_timeout) => {
                match result {
                    Ok(Some(task)) => {
                        if tx.send(task).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Backend unavailability is retriable; keep polling.
                        warn!(error = %e, "workflow poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

async fn activity_poll_loop<B: Backend>(
    inner: Arc<WorkerInner<B>>,
    token: CancellationToken,
    tx: mpsc::Sender<ActivityTask>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = inner.backend.get_activity_task(inner.options.poll_timeout) => {
                match result {
                    Ok(Some(task)) => {
                        if tx.send(task).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "activity poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

fn parallelism_semaphore(max: usize) -> Option<Arc<Semaphore>> {
    (max > 0).then(|| Arc::new(Semaphore::new(max)))
}

async fn workflow_dispatcher<B: Backend + 'static>(
    inner: Arc<WorkerInner<B>>,
    token: CancellationToken,
    mut rx: mpsc::Receiver<WorkflowTask>,
) {
    let semaphore = parallelism_semaphore(inner.options.max_parallel_workflow_tasks);
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };

                while handlers.try_join_next().is_some() {}

                let permit = match &semaphore {
                    Some(semaphore) => match semaphore.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };

                let inner = inner.clone();
                let handler_token = token.child_token();
                handlers.spawn(async move {
                    let _permit = permit;
                    handle_workflow_task(inner, handler_token, task).await;
                });
            }
        }
    }

    // Let in-flight handlers finish their checkpoint attempt.
    while handlers.join_next().await.is_some() {}
}

async fn activity_dispatcher<B: Backend + 'static>(
    inner: Arc<WorkerInner<B>>,
    token: CancellationToken,
    mut rx: mpsc::Receiver<ActivityTask>,
) {
    let semaphore = parallelism_semaphore(inner.options.max_parallel_activity_tasks);
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };

                while handlers.try_join_next().is_some() {}

                let permit = match &semaphore {
                    Some(semaphore) => match semaphore.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };

                let inner = inner.clone();
                let handler_token = token.child_token();
                handlers.spawn(async move {
                    let _permit = permit;
                    handle_activity_task(inner, handler_token, task).await;
                });
            }
        }
    }

    while handlers.join_next().await.is_some() {}
}

async fn handle_workflow_task<B: Backend + 'static>(
    inner: Arc<WorkerInner<B>>,
    token: CancellationToken,
    task: WorkflowTask,
) {
    let instance_id = task.instance.instance_id.clone();
    debug!(instance = %task.instance, task_id = %task.id, new_events = task.new_events.len(), "handling workflow task");

    // Cache hit: the executor retains its continuation and consumes just
    // the new events. Miss: cold replay from the delivered history.
    let executor = match inner.cache.get(&instance_id) {
        Some(executor) => executor,
        None => Arc::new(Mutex::new(WorkflowExecutor::new(
            task.instance.clone(),
            inner.registry.clone(),
            inner.clock.clone(),
            task.history.clone(),
        ))),
    };
    inner.cache.store(instance_id.clone(), executor.clone());

    let heartbeat_token = token.child_token();
    let heartbeat = inner.options.heartbeat_workflow_tasks.then(|| {
        let backend = inner.backend.clone();
        let task_id = task.id.clone();
        let instance = task.instance.clone();
        let interval = inner.options.heartbeat_interval;
        let token = heartbeat_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = backend.extend_workflow_task(&task_id, &instance).await {
                            warn!(task_id = %task_id, error = %e, "workflow heartbeat failed");
                            break;
                        }
                    }
                }
            }
        })
    });

    let result = {
        let mut executor = executor.lock().unwrap();
        executor.execute_task(&task)
    };

    heartbeat_token.cancel();
    if let Some(heartbeat) = heartbeat {
        let _ = heartbeat.await;
    }

    let state = if result.completed {
        WorkflowState::Finished
    } else {
        WorkflowState::Active
    };

    match inner
        .backend
        .complete_workflow_task(
            &task,
            &task.instance,
            state,
            result.executed,
            result.activity_events,
            result.workflow_events,
        )
        .await
    {
        Ok(()) => {
            if result.completed {
                inner.cache.remove(&instance_id);
            }
        }
        Err(BackendError::LeaseLost) => {
            // Another worker owns the task now; our results are discarded
            // and the cached continuation is ahead of durable history.
            debug!(instance = %task.instance, task_id = %task.id, "lease lost, discarding results");
            inner.cache.remove(&instance_id);
        }
        Err(e) => {
            error!(instance = %task.instance, task_id = %task.id, error = %e, "workflow checkpoint failed");
            inner.cache.remove(&instance_id);
        }
    }
}

async fn handle_activity_task<B: Backend + 'static>(
    inner: Arc<WorkerInner<B>>,
    token: CancellationToken,
    task: ActivityTask,
) {
    debug!(instance = %task.instance, task_id = %task.id, "handling activity task");

    let heartbeat_token = token.child_token();
    let heartbeat = {
        let backend = inner.backend.clone();
        let task_id = task.id.clone();
        let interval = inner.options.heartbeat_interval;
        let token = heartbeat_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = backend.extend_activity_task(&task_id).await {
                            warn!(task_id = %task_id, error = %e, "activity heartbeat failed");
                            break;
                        }
                    }
                }
            }
        })
    };

    let executor = ActivityExecutor::new(inner.registry.clone());
    let outcome = executor.execute(&task).await;

    heartbeat_token.cancel();
    let _ = heartbeat.await;

    let attributes = match outcome {
        Ok(result) => EventAttributes::ActivityCompleted { result },
        Err(reason) => EventAttributes::ActivityFailed { reason },
    };
    let event =
        Event::new(inner.clock.now(), attributes).with_schedule_event_id(task.event.id);

    match inner
        .backend
        .complete_activity_task(&task.instance, &task.id, event)
        .await
    {
        Ok(()) => {}
        Err(BackendError::LeaseLost) => {
            debug!(task_id = %task.id, "activity lease lost, discarding result");
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "activity completion failed");
        }
    }
}
