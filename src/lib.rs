//! Praxis: Durable Workflow Execution Engine for Rust
//!
//! `praxis` (πρᾶξις, Greek for "action") runs user-defined orchestration
//! programs reliably across process restarts by persisting their progress as
//! an ordered event log and replaying that log to reconstruct in-memory
//! state. Workflows schedule long-running activities, wait on durable
//! timers, accept signals, and spawn sub-workflows; every activity executes
//! at least once, and workflow logic produces deterministic decisions given
//! an identical history.
//!
//! # Features
//!
//! - **Event-sourced histories**: every state change is an ordered,
//!   persisted event; replay reconstructs executor state after a crash
//! - **Lease-based task queues**: at-least-once delivery with heartbeats
//!   and automatic redelivery when a worker disappears
//! - **Executor cache**: warm executors skip cold replay and advance by
//!   just the new events
//! - **Pluggable backends**: an in-memory reference backend, plus a
//!   log-structured Redis backend (streams + consumer groups) behind the
//!   `redis` feature
//!
//! # Quick Start
//!
//! ```ignore
//! use praxis::prelude::*;
//! use std::time::Duration;
//!
//! async fn greet(_ctx: ActivityContext, name: String) -> Result<String, String> {
//!     Ok(format!("hello {}", name))
//! }
//!
//! async fn greeting_workflow(ctx: WorkflowContext, name: String) -> Result<String, String> {
//!     ctx.schedule_activity::<String>("greet", (name,)).await
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(InMemoryBackend::new());
//!
//!     let worker = Worker::new(backend.clone());
//!     worker.register_workflow("greeting", greeting_workflow)?;
//!     worker.register_activity("greet", greet)?;
//!     let handle = worker.start();
//!
//!     let client = Client::new(backend);
//!     let instance = client
//!         .create_workflow_instance(
//!             WorkflowInstanceOptions { instance_id: "greeting-1".into() },
//!             "greeting",
//!             ("world".to_string(),),
//!         )
//!         .await?;
//!
//!     let result: String = client
//!         .get_workflow_result(&instance, Duration::from_secs(10))
//!         .await?;
//!     println!("{}", result);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! Each module hides a design decision that is likely to change:
//!
//! - [`core`]: event model, instances, payloads (hides serialization)
//! - [`storage`]: backend contract and implementations (hides the store)
//! - [`executor`]: deterministic replay and caching (hides the strategy)
//! - [`worker`]: polling, dispatch, heartbeats (hides the concurrency)
//! - [`client`]: the user-facing façade

pub mod client;
pub mod core;
pub mod executor;
pub mod storage;
pub mod worker;

// Re-export commonly used types for convenience
pub use crate::core::{
    from_payload, to_payload, Clock, CoreError, Event, EventAttributes, EventType, IntoInputs,
    Payload, SystemClock, WorkflowEvent, WorkflowInstance, WorkflowState,
};

pub use client::{Client, ClientError, WorkflowInstanceOptions};

pub use executor::{
    ActivityContext, ActivityExecutor, CacheOptions, ExecutionError, ExecutionResult,
    ExecutorCache, Registry, WorkflowContext, WorkflowExecutor,
};

pub use storage::{Backend, BackendError, InMemoryBackend, MemoryBackendOptions};

#[cfg(feature = "redis")]
pub use storage::{RedisBackend, RedisOptions};

pub use worker::{Worker, WorkerHandle, WorkerOptions};

// Re-export dependencies used in the public API so downstream crates don't
// hit version mismatches.
pub use serde;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports.
///
/// ```ignore
/// use praxis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::{Client, ClientError, WorkflowInstanceOptions};
    pub use crate::core::{IntoInputs, WorkflowInstance, WorkflowState};
    pub use crate::executor::{ActivityContext, WorkflowContext};
    pub use crate::storage::{Backend, InMemoryBackend};
    pub use crate::worker::{Worker, WorkerHandle, WorkerOptions};

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisBackend;

    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
