//! Log-structured Redis backend.
//!
//! # Data Structures
//!
//! - `history:{instance_id}` (STREAM): committed history events, JSON payload
//! - `pending:{instance_id}` (STREAM): unconsumed events; trimmed at checkpoint
//! - `instance:{instance_id}` (HASH): `execution_id`, `state`, `seq` tail,
//!   optional parent linkage
//! - `task-set:workflows` / `task-set:activities` (SET): ids currently in
//!   queue, preventing duplicate scheduling
//! - `task-stream:workflows` / `task-stream:activities` (STREAM + consumer
//!   group `task-workers`): queue entries with native lease semantics
//! - `future-events` (ZSET): `future:{instance_id}:{event_id}` keyed by
//!   visibility time
//! - `future:{instance_id}:{event_id}` (STRING): serialized pending event
//!
//! # Atomicity
//!
//! Every compound operation is a Lua script: instance creation
//! (HSET + XADD + enqueue), signal/cancel delivery, future-event promotion
//! (triggered opportunistically on every workflow dequeue), task completion
//! (SREM + XACK + XDEL), and the checkpoint. The checkpoint script validates
//! the lease and any sub-workflow creations before its first write, so an
//! error reply leaves storage untouched.
//!
//! Sequence ids are a dense per-instance counter in the instance hash,
//! assigned by the checkpoint; the lease guarantees at most one active task
//! per instance, so the read-assign-write is race-free.

use super::error::{BackendError, Result};
use super::taskqueue::{value_to_string, TaskQueue};
use super::Backend;
use crate::core::{
    deserialize_event, serialize_event, ActivityTask, Event, EventType, ParentInstance,
    WorkflowEvent, WorkflowInstance, WorkflowState, WorkflowTask,
};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_DELIVERY_WARN: u64 = 10;

/// Configuration for [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Longest single XREADGROUP block; dequeues loop this until their
    /// caller-supplied timeout elapses.
    pub block_timeout: Duration,
    /// Idle time after which a pending entry is claimable by another
    /// consumer.
    pub lease_timeout: Duration,
    /// Delivery count above which a redelivered task is logged for the
    /// operator. The core does not dead-letter.
    pub max_delivery_warn: u64,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            max_delivery_warn: DEFAULT_MAX_DELIVERY_WARN,
        }
    }
}

impl RedisOptions {
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct ActivityQueueData {
    instance: WorkflowInstance,
    event: Event,
}

/// Descriptor for one cross-instance event, decoded by the checkpoint
/// script with cjson.
#[derive(Serialize)]
struct WorkflowEventDescriptor {
    instance_id: String,
    execution_id: String,
    event: String,
    create: u8,
    parent_instance_id: String,
    parent_schedule_event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    visible_at: Option<i64>,
    future_key: String,
    payload: String,
}

/// Payload stored under `future:{instance_id}:{event_id}`.
#[derive(Serialize, Deserialize)]
struct FutureEventPayload {
    instance_id: String,
    event: String,
}

// KEYS[1] instance, KEYS[2] history, KEYS[3] task-set, KEYS[4] task-stream
// ARGV[1] execution_id, ARGV[2] event json, ARGV[3] instance_id,
// ARGV[4] parent_instance_id, ARGV[5] parent_schedule_event_id
const CREATE_INSTANCE_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[1], "execution_id", ARGV[1], "state", "ACTIVE", "seq", 1)
    if ARGV[4] ~= "" then
        redis.call("HSET", KEYS[1], "parent_instance_id", ARGV[4], "parent_schedule_event_id", ARGV[5])
    end
    redis.call("XADD", KEYS[2], "*", "event", ARGV[2])
    if redis.call("SADD", KEYS[3], ARGV[3]) == 1 then
        redis.call("XADD", KEYS[4], "*", "id", ARGV[3], "data", "{}")
    end
    return 1
"#;

// KEYS[1] instance, KEYS[2] pending, KEYS[3] task-set, KEYS[4] task-stream
// ARGV[1] event json, ARGV[2] instance_id
const APPEND_PENDING_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 0 then
        return 0
    end
    if redis.call("HGET", KEYS[1], "state") ~= "ACTIVE" then
        return 0
    end
    redis.call("XADD", KEYS[2], "*", "event", ARGV[1])
    if redis.call("SADD", KEYS[3], ARGV[2]) == 1 then
        redis.call("XADD", KEYS[4], "*", "id", ARGV[2], "data", "{}")
    end
    return 1
"#;

// KEYS[1] future-events zset, KEYS[2] task-set, KEYS[3] task-stream
// ARGV[1] now (unix ms)
const PROMOTE_FUTURE_SCRIPT: &str = r#"
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], 0, ARGV[1], "LIMIT", 0, 50)
    local moved = 0
    for _, key in ipairs(due) do
        local payload = redis.call("GET", key)
        if payload then
            local fe = cjson.decode(payload)
            local instance_key = "instance:" .. fe.instance_id
            if redis.call("EXISTS", instance_key) == 1 and redis.call("HGET", instance_key, "state") == "ACTIVE" then
                redis.call("XADD", "pending:" .. fe.instance_id, "*", "event", fe.event)
                if redis.call("SADD", KEYS[2], fe.instance_id) == 1 then
                    redis.call("XADD", KEYS[3], "*", "id", fe.instance_id, "data", "{}")
                end
                moved = moved + 1
            end
        end
        redis.call("DEL", key)
        redis.call("ZREM", KEYS[1], key)
    end
    return moved
"#;

// The checkpoint. Validates, then applies every effect; error replies leave
// storage untouched.
// KEYS[1] task-set:workflows, KEYS[2] task-stream:workflows,
// KEYS[3] instance, KEYS[4] history, KEYS[5] pending,
// KEYS[6] future-events, KEYS[7] task-set:activities,
// KEYS[8] task-stream:activities
// ARGV[1] task_id, ARGV[2] group, ARGV[3] instance_id,
// ARGV[4] last_pending_id ("" = none), ARGV[5] state, ARGV[6] seq tail,
// ARGV[7] n_executed, ARGV[8] n_activity, ARGV[9] n_workflow,
// ARGV[10..] executed jsons, activity descriptors, workflow descriptors
const CHECKPOINT_SCRIPT: &str = r#"
    local task = redis.call("XRANGE", KEYS[2], ARGV[1], ARGV[1])
    if #task == 0 then
        return redis.error_reply("LEASE_LOST")
    end
    if redis.call("HGET", KEYS[3], "state") ~= "ACTIVE" then
        return redis.error_reply("INSTANCE_NOT_FOUND")
    end

    local n_exec = tonumber(ARGV[7])
    local n_act = tonumber(ARGV[8])
    local n_wf = tonumber(ARGV[9])
    local base = 9

    for i = 1, n_wf do
        local wf = cjson.decode(ARGV[base + n_exec + n_act + i])
        if wf.create == 1 and redis.call("EXISTS", "instance:" .. wf.instance_id) == 1 then
            return redis.error_reply("INSTANCE_EXISTS")
        end
    end

    for i = 1, n_exec do
        redis.call("XADD", KEYS[4], "*", "event", ARGV[base + i])
    end
    redis.call("HSET", KEYS[3], "seq", ARGV[6])

    if ARGV[4] ~= "" then
        local delivered = redis.call("XRANGE", KEYS[5], "-", ARGV[4])
        for _, msg in ipairs(delivered) do
            redis.call("XDEL", KEYS[5], msg[1])
        end
    end

    for i = 1, n_act do
        local act = cjson.decode(ARGV[base + n_exec + i])
        if redis.call("SADD", KEYS[7], act.event_id) == 1 then
            redis.call("XADD", KEYS[8], "*", "id", act.event_id, "data", act.data)
        end
    end

    for i = 1, n_wf do
        local wf = cjson.decode(ARGV[base + n_exec + n_act + i])
        local target = "instance:" .. wf.instance_id
        if wf.create == 1 then
            redis.call("HSET", target, "execution_id", wf.execution_id, "state", "ACTIVE", "seq", 1)
            if wf.parent_instance_id ~= "" then
                redis.call("HSET", target, "parent_instance_id", wf.parent_instance_id, "parent_schedule_event_id", wf.parent_schedule_event_id)
            end
            redis.call("XADD", "history:" .. wf.instance_id, "*", "event", wf.event)
            if redis.call("SADD", KEYS[1], wf.instance_id) == 1 then
                redis.call("XADD", KEYS[2], "*", "id", wf.instance_id, "data", "{}")
            end
        elseif wf.visible_at then
            redis.call("ZADD", KEYS[6], wf.visible_at, wf.future_key)
            redis.call("SET", wf.future_key, wf.payload)
        else
            if redis.call("EXISTS", target) == 1 and redis.call("HGET", target, "state") == "ACTIVE" then
                redis.call("XADD", "pending:" .. wf.instance_id, "*", "event", wf.event)
                if redis.call("SADD", KEYS[1], wf.instance_id) == 1 then
                    redis.call("XADD", KEYS[2], "*", "id", wf.instance_id, "data", "{}")
                end
            end
        end
    end

    local id = task[1][2][2]
    redis.call("SREM", KEYS[1], id)
    redis.call("XACK", KEYS[2], ARGV[2], ARGV[1])
    redis.call("XDEL", KEYS[2], ARGV[1])

    if ARGV[5] == "FINISHED" then
        redis.call("HSET", KEYS[3], "state", "FINISHED")
        redis.call("DEL", KEYS[5])
        local futures = redis.call("ZRANGE", KEYS[6], 0, -1)
        local prefix = "future:" .. ARGV[3] .. ":"
        for _, key in ipairs(futures) do
            if string.sub(key, 1, string.len(prefix)) == prefix then
                redis.call("ZREM", KEYS[6], key)
                redis.call("DEL", key)
            end
        end
    else
        if redis.call("XLEN", KEYS[5]) > 0 then
            if redis.call("SADD", KEYS[1], ARGV[3]) == 1 then
                redis.call("XADD", KEYS[2], "*", "id", ARGV[3], "data", "{}")
            end
        end
    end

    return 1
"#;

// KEYS[1] task-set:activities, KEYS[2] task-stream:activities,
// KEYS[3] instance, KEYS[4] pending, KEYS[5] task-set:workflows,
// KEYS[6] task-stream:workflows
// ARGV[1] task_id, ARGV[2] group, ARGV[3] event json, ARGV[4] instance_id
const COMPLETE_ACTIVITY_SCRIPT: &str = r#"
    local task = redis.call("XRANGE", KEYS[2], ARGV[1], ARGV[1])
    if #task == 0 then
        return redis.error_reply("LEASE_LOST")
    end
    local id = task[1][2][2]
    redis.call("SREM", KEYS[1], id)
    redis.call("XACK", KEYS[2], ARGV[2], ARGV[1])
    redis.call("XDEL", KEYS[2], ARGV[1])
    if redis.call("EXISTS", KEYS[3]) == 1 and redis.call("HGET", KEYS[3], "state") == "ACTIVE" then
        redis.call("XADD", KEYS[4], "*", "event", ARGV[3])
        if redis.call("SADD", KEYS[5], ARGV[4]) == 1 then
            redis.call("XADD", KEYS[6], "*", "id", ARGV[4], "data", "{}")
        end
    end
    return 1
"#;

/// Redis implementation of [`Backend`] over streams and consumer groups.
pub struct RedisBackend {
    pool: Pool,
    options: RedisOptions,
    workflow_queue: TaskQueue,
    activity_queue: TaskQueue,
    create_script: Script,
    append_pending_script: Script,
    promote_future_script: Script,
    checkpoint_script: Script,
    complete_activity_script: Script,
}

impl RedisBackend {
    /// Connects to Redis and creates the task queues and consumer groups.
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_options(redis_url, RedisOptions::default()).await
    }

    pub async fn with_options(redis_url: &str, options: RedisOptions) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let workflow_queue = TaskQueue::new(&mut *conn, "workflows").await?;
        let activity_queue = TaskQueue::new(&mut *conn, "activities").await?;

        Ok(Self {
            pool,
            options,
            workflow_queue,
            activity_queue,
            create_script: Script::new(CREATE_INSTANCE_SCRIPT),
            append_pending_script: Script::new(APPEND_PENDING_SCRIPT),
            promote_future_script: Script::new(PROMOTE_FUTURE_SCRIPT),
            checkpoint_script: Script::new(CHECKPOINT_SCRIPT),
            complete_activity_script: Script::new(COMPLETE_ACTIVITY_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    fn instance_key(instance_id: &str) -> String {
        format!("instance:{}", instance_id)
    }

    fn history_key(instance_id: &str) -> String {
        format!("history:{}", instance_id)
    }

    fn pending_key(instance_id: &str) -> String {
        format!("pending:{}", instance_id)
    }

    fn future_key(instance_id: &str, event_id: Uuid) -> String {
        format!("future:{}:{}", instance_id, event_id)
    }

    fn map_script_error(e: redis::RedisError) -> BackendError {
        let message = e.to_string();
        if message.contains("LEASE_LOST") {
            BackendError::LeaseLost
        } else if message.contains("INSTANCE_EXISTS") {
            BackendError::InstanceAlreadyExists
        } else if message.contains("INSTANCE_NOT_FOUND") {
            BackendError::InstanceNotFound
        } else {
            BackendError::Unavailable(message)
        }
    }

    /// Reads the instance hash into a [`WorkflowInstance`] plus its state.
    async fn read_instance(
        &self,
        conn: &mut deadpool_redis::Connection,
        instance_id: &str,
    ) -> Result<Option<(WorkflowInstance, WorkflowState)>> {
        let fields: Vec<Option<String>> = conn
            .hget(
                Self::instance_key(instance_id),
                &[
                    "execution_id",
                    "state",
                    "parent_instance_id",
                    "parent_schedule_event_id",
                ][..],
            )
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut fields = fields.into_iter();
        let Some(execution_id) = fields.next().flatten() else {
            return Ok(None);
        };
        let state = fields
            .next()
            .flatten()
            .and_then(|s| s.parse::<WorkflowState>().ok())
            .unwrap_or(WorkflowState::Active);
        let parent_instance_id = fields.next().flatten();
        let parent_schedule_event_id = fields
            .next()
            .flatten()
            .and_then(|s| Uuid::parse_str(&s).ok());

        let parent = match (parent_instance_id, parent_schedule_event_id) {
            (Some(instance_id), Some(schedule_event_id)) => Some(ParentInstance {
                instance_id,
                schedule_event_id,
            }),
            _ => None,
        };

        Ok(Some((
            WorkflowInstance {
                instance_id: instance_id.to_string(),
                execution_id,
                parent,
            },
            state,
        )))
    }

    /// Reads a whole event stream: `(message_id, event)` pairs in order.
    async fn read_event_stream(
        &self,
        conn: &mut deadpool_redis::Connection,
        key: &str,
    ) -> Result<Vec<(String, Event)>> {
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(key)
            .arg("-")
            .arg("+")
            .query_async(&mut **conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let redis::Value::Array(messages) = reply else {
            return Ok(Vec::new());
        };

        let mut events = Vec::with_capacity(messages.len());
        for message in messages {
            let redis::Value::Array(parts) = message else {
                continue;
            };
            let mut parts = parts.into_iter();
            let Some(message_id) = parts.next().as_ref().and_then(value_to_string) else {
                continue;
            };
            let Some(redis::Value::Array(fields)) = parts.next() else {
                continue;
            };

            let mut fields = fields.into_iter();
            while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
                if value_to_string(&name).as_deref() == Some("event") {
                    if let Some(raw) = value_to_string(&value) {
                        let event = deserialize_event(raw.as_bytes())?;
                        events.push((message_id.clone(), event));
                    }
                }
            }
        }
        Ok(events)
    }

    fn workflow_event_descriptor(&self, we: &WorkflowEvent) -> Result<String> {
        let event_json = String::from_utf8(serialize_event(&we.event)?)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let create = we.event.event_type() == EventType::ExecutionStarted;
        let future_key = Self::future_key(&we.instance.instance_id, we.event.id);
        let payload = serde_json::to_string(&FutureEventPayload {
            instance_id: we.instance.instance_id.clone(),
            event: event_json.clone(),
        })
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let descriptor = WorkflowEventDescriptor {
            instance_id: we.instance.instance_id.clone(),
            execution_id: we.instance.execution_id.clone(),
            event: event_json,
            create: create as u8,
            parent_instance_id: we
                .instance
                .parent
                .as_ref()
                .map(|p| p.instance_id.clone())
                .unwrap_or_default(),
            parent_schedule_event_id: we
                .instance
                .parent
                .as_ref()
                .map(|p| p.schedule_event_id.to_string())
                .unwrap_or_default(),
            visible_at: (!create)
                .then(|| we.event.visible_at.map(|at| at.timestamp_millis()))
                .flatten(),
            future_key,
            payload,
        };
        serde_json::to_string(&descriptor).map_err(|e| BackendError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn create_workflow_instance(&self, event: WorkflowEvent) -> Result<()> {
        let mut conn = self.connection().await?;

        let mut started = event.event;
        started.sequence_id = 1;
        let event_json = serialize_event(&started)?;
        let instance = &event.instance;

        let created: i64 = self
            .create_script
            .key(Self::instance_key(&instance.instance_id))
            .key(Self::history_key(&instance.instance_id))
            .key(self.workflow_queue.set_key())
            .key(self.workflow_queue.stream_key())
            .arg(&instance.execution_id)
            .arg(event_json)
            .arg(&instance.instance_id)
            .arg(
                instance
                    .parent
                    .as_ref()
                    .map(|p| p.instance_id.clone())
                    .unwrap_or_default(),
            )
            .arg(
                instance
                    .parent
                    .as_ref()
                    .map(|p| p.schedule_event_id.to_string())
                    .unwrap_or_default(),
            )
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if created == 0 {
            return Err(BackendError::InstanceAlreadyExists);
        }
        debug!(instance = %instance, "created workflow instance");
        Ok(())
    }

    async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: Event,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let event_json = serialize_event(&event)?;

        let delivered: i64 = self
            .append_pending_script
            .key(Self::instance_key(&instance.instance_id))
            .key(Self::pending_key(&instance.instance_id))
            .key(self.workflow_queue.set_key())
            .key(self.workflow_queue.stream_key())
            .arg(event_json)
            .arg(&instance.instance_id)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if delivered == 0 {
            return Err(BackendError::InstanceNotFound);
        }
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<()> {
        let mut conn = self.connection().await?;
        let event_json = serialize_event(&event)?;

        let delivered: i64 = self
            .append_pending_script
            .key(Self::instance_key(instance_id))
            .key(Self::pending_key(instance_id))
            .key(self.workflow_queue.set_key())
            .key(self.workflow_queue.stream_key())
            .arg(event_json)
            .arg(instance_id)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if delivered == 0 {
            return Err(BackendError::InstanceNotFound);
        }
        Ok(())
    }

    async fn get_workflow_instance_state(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowState> {
        let mut conn = self.connection().await?;
        let state: Option<String> = conn
            .hget(Self::instance_key(&instance.instance_id), "state")
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        state
            .and_then(|s| s.parse::<WorkflowState>().ok())
            .ok_or(BackendError::InstanceNotFound)
    }

    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
        after_sequence_id: Option<i64>,
    ) -> Result<Vec<Event>> {
        let mut conn = self.connection().await?;

        let exists: bool = conn
            .exists(Self::instance_key(&instance.instance_id))
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if !exists {
            return Err(BackendError::InstanceNotFound);
        }

        let after = after_sequence_id.unwrap_or(0);
        let events = self
            .read_event_stream(&mut conn, &Self::history_key(&instance.instance_id))
            .await?;
        Ok(events
            .into_iter()
            .map(|(_, event)| event)
            .filter(|event| event.sequence_id > after)
            .collect())
    }

    async fn get_workflow_task(&self, timeout: Duration) -> Result<Option<WorkflowTask>> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.connection().await?;

        loop {
            // Sweep due future events before each dequeue attempt.
            let _: i64 = self
                .promote_future_script
                .key("future-events")
                .key(self.workflow_queue.set_key())
                .key(self.workflow_queue.stream_key())
                .arg(Utc::now().timestamp_millis())
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let block = self.options.block_timeout.min(deadline - now);

            let Some(item) = self
                .workflow_queue
                .dequeue(&mut *conn, self.options.lease_timeout, block)
                .await?
            else {
                continue;
            };

            if let Ok(Some(count)) = self
                .workflow_queue
                .delivery_count(&mut *conn, &item.task_id)
                .await
            {
                if count > self.options.max_delivery_warn {
                    warn!(
                        task_id = %item.task_id,
                        instance_id = %item.id,
                        deliveries = count,
                        "workflow task redelivered past the reporting bound"
                    );
                }
            }

            let Some((instance, state)) = self.read_instance(&mut conn, &item.id).await? else {
                // The instance hash is gone; drop the stale queue entry.
                self.workflow_queue.complete(&mut *conn, &item.task_id).await?;
                continue;
            };
            if state == WorkflowState::Finished {
                self.workflow_queue.complete(&mut *conn, &item.task_id).await?;
                continue;
            }

            let history = self
                .read_event_stream(&mut conn, &Self::history_key(&item.id))
                .await?;
            let pending = self
                .read_event_stream(&mut conn, &Self::pending_key(&item.id))
                .await?;

            let last_pending_event_id = pending.last().map(|(message_id, _)| message_id.clone());
            return Ok(Some(WorkflowTask {
                id: item.task_id,
                instance,
                history: history.into_iter().map(|(_, event)| event).collect(),
                new_events: pending.into_iter().map(|(_, event)| event).collect(),
                last_pending_event_id,
            }));
        }
    }

    async fn extend_workflow_task(
        &self,
        task_id: &str,
        _instance: &WorkflowInstance,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        self.workflow_queue.extend(&mut *conn, task_id).await
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

        let mut conn = self.connection().await?;

        let state = if executed_events.iter().any(|e| e.is_terminal()) {
            WorkflowState::Finished
        } else {
            state
        };

        // The lease guarantees at most one active task per instance, so
        // reading the sequence tail outside the script is race-free.
        let tail: Option<i64> = conn
            .hget(Self::instance_key(&instance.instance_id), "seq")
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let mut sequence_id = tail.ok_or(BackendError::InstanceNotFound)?;

        let mut executed_json = Vec::with_capacity(executed_events.len());
        for mut event in executed_events {
            sequence_id += 1;
            event.sequence_id = sequence_id;
            executed_json.push(
                String::from_utf8(serialize_event(&event)?)
                    .map_err(|e| BackendError::Unavailable(e.to_string()))?,
            );
        }

        let mut activity_json = Vec::with_capacity(activity_events.len());
        for event in activity_events {
            let data = serde_json::to_string(&ActivityQueueData {
                instance: instance.clone(),
                event: event.clone(),
            })
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            let descriptor = serde_json::json!({
                "event_id": event.id.to_string(),
                "data": data,
            });
            activity_json.push(descriptor.to_string());
        }

        let mut workflow_json = Vec::with_capacity(workflow_events.len());
        for we in &workflow_events {
            workflow_json.push(self.workflow_event_descriptor(we)?);
        }

        let mut invocation = self.checkpoint_script.prepare_invoke();
        invocation
            .key(self.workflow_queue.set_key())
            .key(self.workflow_queue.stream_key())
            .key(Self::instance_key(&instance.instance_id))
            .key(Self::history_key(&instance.instance_id))
            .key(Self::pending_key(&instance.instance_id))
            .key("future-events")
            .key(self.activity_queue.set_key())
            .key(self.activity_queue.stream_key())
            .arg(&task.id)
            .arg(self.workflow_queue.group_name())
            .arg(&instance.instance_id)
            .arg(task.last_pending_event_id.as_deref().unwrap_or(""))
            .arg(state.as_str())
            .arg(sequence_id)
            .arg(executed_json.len())
            .arg(activity_json.len())
            .arg(workflow_json.len());
        for json in executed_json
            .iter()
            .chain(activity_json.iter())
            .chain(workflow_json.iter())
        {
            invocation.arg(json.as_str());
        }

        let _: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::map_script_error)?;

        debug!(instance = %instance, task_id = %task.id, state = %state, "checkpointed workflow task");
        Ok(())
    }

    async fn get_activity_task(&self, timeout: Duration) -> Result<Option<ActivityTask>> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.connection().await?;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let block = self.options.block_timeout.min(deadline - now);

            let Some(item) = self
                .activity_queue
                .dequeue(&mut *conn, self.options.lease_timeout, block)
                .await?
            else {
                continue;
            };

            let data: ActivityQueueData = match serde_json::from_str(&item.data) {
                Ok(data) => data,
                Err(e) => {
                    warn!(task_id = %item.task_id, error = %e, "dropping undecodable activity entry");
                    self.activity_queue.complete(&mut *conn, &item.task_id).await?;
                    continue;
                }
            };

            return Ok(Some(ActivityTask {
                id: item.task_id,
                instance: data.instance,
                event: data.event,
            }));
        }
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let event_json = serialize_event(&event)?;

        let _: i64 = self
            .complete_activity_script
            .key(self.activity_queue.set_key())
            .key(self.activity_queue.stream_key())
            .key(Self::instance_key(&instance.instance_id))
            .key(Self::pending_key(&instance.instance_id))
            .key(self.workflow_queue.set_key())
            .key(self.workflow_queue.stream_key())
            .arg(task_id)
            .arg(self.activity_queue.group_name())
            .arg(event_json)
            .arg(&instance.instance_id)
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::map_script_error)?;

        Ok(())
    }

    async fn extend_activity_task(&self, task_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        self.activity_queue.extend(&mut *conn, task_id).await
    }
}
