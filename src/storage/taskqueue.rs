//! Lease-based task queue over Redis streams and consumer groups.
//!
//! A queue is a set of caller-provided ids (dedup guard) plus a stream with
//! one consumer group. Enqueue is scripted so the set check and the stream
//! append are one atomic step; completion is scripted so the set removal,
//! the XACK and the XDEL are one atomic step. The stream's idle-time
//! semantics provide the lease: `XAUTOCLAIM` recovers entries idle past the
//! lease timeout, and `XCLAIM` with a zero min-idle resets the timer.

use super::error::{BackendError, Result};
use redis::aio::ConnectionLike;
use redis::Script;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A dequeued queue entry. `task_id` is the stream message id and doubles
/// as the lease handle; `id` is the caller-provided id; `data` is the
/// payload stored at enqueue time.
pub(crate) struct TaskItem {
    pub task_id: String,
    pub id: String,
    pub data: String,
}

pub(crate) struct TaskQueue {
    set_key: String,
    stream_key: String,
    group_name: String,
    worker_name: String,
    enqueue_script: Script,
    complete_script: Script,
}

// KEYS[1] = set, KEYS[2] = stream
// ARGV[1] = caller-provided id, ARGV[2] = payload
// The set guards against duplicates: an id already queued (or still being
// processed) is not enqueued again.
const ENQUEUE_SCRIPT: &str = r#"
    if redis.call("SADD", KEYS[1], ARGV[1]) == 0 then
        return 0
    end
    redis.call("XADD", KEYS[2], "*", "id", ARGV[1], "data", ARGV[2])
    return 1
"#;

// KEYS[1] = set, KEYS[2] = stream
// ARGV[1] = task (message) id, ARGV[2] = group
// XACK and XDEL are both required; see the stream documentation on
// acknowledged-but-retained entries. A missing message means the lease was
// lost to another consumer that already completed the task.
const COMPLETE_SCRIPT: &str = r#"
    local task = redis.call("XRANGE", KEYS[2], ARGV[1], ARGV[1])
    if #task == 0 then
        return 0
    end
    local id = task[1][2][2]
    redis.call("SREM", KEYS[1], id)
    redis.call("XACK", KEYS[2], ARGV[2], ARGV[1])
    redis.call("XDEL", KEYS[2], ARGV[1])
    return 1
"#;

impl TaskQueue {
    /// Creates the queue and its consumer group (idempotently).
    pub async fn new<C: ConnectionLike>(conn: &mut C, task_type: &str) -> Result<Self> {
        let queue = Self {
            set_key: format!("task-set:{}", task_type),
            stream_key: format!("task-stream:{}", task_type),
            group_name: "task-workers".to_string(),
            worker_name: Uuid::new_v4().to_string(),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
        };

        let created: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&queue.stream_key)
            .arg(&queue.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        if let Err(e) = created {
            // No upsert for consumer groups; an existing group is fine.
            if !e.to_string().contains("BUSYGROUP") {
                return Err(BackendError::Unavailable(e.to_string()));
            }
        }

        Ok(queue)
    }

    pub fn set_key(&self) -> &str {
        &self.set_key
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Enqueues an entry; returns `false` when the id was already queued.
    pub async fn enqueue<C: ConnectionLike>(
        &self,
        conn: &mut C,
        id: &str,
        data: &str,
    ) -> Result<bool> {
        let added: i64 = self
            .enqueue_script
            .key(&self.set_key)
            .key(&self.stream_key)
            .arg(id)
            .arg(data)
            .invoke_async(conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(added == 1)
    }

    /// Dequeues the next entry, preferring abandoned entries idle past the
    /// lease timeout. Blocks up to `block_timeout` and returns `None` when
    /// nothing arrived.
    pub async fn dequeue<C: ConnectionLike>(
        &self,
        conn: &mut C,
        lease_timeout: Duration,
        block_timeout: Duration,
    ) -> Result<Option<TaskItem>> {
        if let Some(task) = self.recover(conn, lease_timeout).await? {
            debug!(task_id = %task.task_id, queue = %self.stream_key, "recovered abandoned task");
            return Ok(Some(task));
        }

        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group_name)
            .arg(&self.worker_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_timeout.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        // Reply shape: [[stream, [[message-id, [field, value, ...]], ...]]]
        let redis::Value::Array(streams) = reply else {
            return Ok(None);
        };
        let Some(redis::Value::Array(stream)) = streams.into_iter().next() else {
            return Ok(None);
        };
        let Some(redis::Value::Array(messages)) = stream.into_iter().nth(1) else {
            return Ok(None);
        };
        let Some(message) = messages.into_iter().next() else {
            return Ok(None);
        };

        Ok(parse_message(message))
    }

    /// Resets the lease timer by re-claiming the message for this consumer.
    pub async fn extend<C: ConnectionLike>(&self, conn: &mut C, task_id: &str) -> Result<()> {
        let reply: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(&self.worker_name)
            .arg(0) // always claim; claiming resets the idle timer
            .arg(task_id)
            .query_async(conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        match reply {
            redis::Value::Array(claimed) if !claimed.is_empty() => Ok(()),
            _ => Err(BackendError::LeaseLost),
        }
    }

    /// Completes an entry; returns `false` when the message was no longer
    /// held (lease lost).
    pub async fn complete<C: ConnectionLike>(&self, conn: &mut C, task_id: &str) -> Result<bool> {
        let removed: i64 = self
            .complete_script
            .key(&self.set_key)
            .key(&self.stream_key)
            .arg(task_id)
            .arg(&self.group_name)
            .invoke_async(conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(removed == 1)
    }

    /// Delivery count of a pending message, for redelivery-cap reporting.
    pub async fn delivery_count<C: ConnectionLike>(
        &self,
        conn: &mut C,
        task_id: &str,
    ) -> Result<Option<u64>> {
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(task_id)
            .arg(task_id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        // Reply shape: [[id, consumer, idle-ms, delivery-count]]
        let redis::Value::Array(entries) = reply else {
            return Ok(None);
        };
        let Some(redis::Value::Array(entry)) = entries.into_iter().next() else {
            return Ok(None);
        };
        match entry.into_iter().nth(3) {
            Some(redis::Value::Int(count)) => Ok(Some(count as u64)),
            _ => Ok(None),
        }
    }

    async fn recover<C: ConnectionLike>(
        &self,
        conn: &mut C,
        lease_timeout: Duration,
    ) -> Result<Option<TaskItem>> {
        // Completed tasks are deleted from the stream, so the pending scan
        // can always start from the beginning.
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(&self.worker_name)
            .arg(lease_timeout.as_millis() as u64)
            .arg("0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        // Reply shape: [next-cursor, [[message-id, [field, value, ...]], ...], [deleted-ids]]
        let redis::Value::Array(parts) = reply else {
            return Ok(None);
        };
        let Some(redis::Value::Array(messages)) = parts.into_iter().nth(1) else {
            return Ok(None);
        };
        let Some(message) = messages.into_iter().next() else {
            return Ok(None);
        };

        Ok(parse_message(message))
    }
}

pub(crate) fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_message(message: redis::Value) -> Option<TaskItem> {
    let redis::Value::Array(parts) = message else {
        return None;
    };
    let mut parts = parts.into_iter();
    let task_id = value_to_string(&parts.next()?)?;
    let redis::Value::Array(fields) = parts.next()? else {
        return None;
    };

    let mut id = None;
    let mut data = None;
    let mut fields = fields.into_iter();
    while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
        match value_to_string(&name)?.as_str() {
            "id" => id = value_to_string(&value),
            "data" => data = value_to_string(&value),
            _ => {}
        }
    }

    Some(TaskItem {
        task_id,
        id: id?,
        data: data?,
    })
}
