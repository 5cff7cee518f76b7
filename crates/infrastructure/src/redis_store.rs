//! Redis存储后端
//!
//! 键布局:
//! - `job:{id}` 作业哈希，`jobs:index` 按创建时间排序的有序集合，`jobs:running` 运行中集合
//! - `job:{id}:cancel` 取消标记
//! - `queue:{type}` 就绪队列 (LPUSH 入队尾, RPOP 出队首)，`queue:delayed` 延迟有序集合
//! - `queue:dlq` 死信ID列表，`dlq:entries` 死信详情哈希
//! - `worker:{id}:heartbeat` 心跳JSON，`workers` 已知Worker集合

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, warn};

use jobqueue_domain::{
    DeadLetterEntry, DeadLetterQueue, HeartbeatStore, Job, JobPage, JobQueue, JobStatus,
    JobStore, JobType, JobUpdate, ProgressEvent, QueueEntry, WorkerHeartbeat,
};
use jobqueue_errors::{JobQueueError, JobQueueResult};

/// 乐观CAS冲突时的最大重读次数
const MAX_CAS_ATTEMPTS: usize = 8;

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// 仅当状态、持有者与 updated_at 均未变化时写入，否则返回0由调用方重读
const TRANSITION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local cur = redis.call('HMGET', KEYS[1], 'status', 'owner_worker_id', 'updated_at')
if cur[1] ~= ARGV[1] or (cur[2] or '') ~= ARGV[2] or cur[3] ~= ARGV[3] then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 6))
if ARGV[5] == 'running' then
  redis.call('SADD', KEYS[2], ARGV[4])
else
  redis.call('SREM', KEYS[2], ARGV[4])
end
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
for _, member in ipairs(due) do
  local sep = string.find(member, '|', 1, true)
  if sep then
    local job_type = string.sub(member, 1, sep - 1)
    local job_id = string.sub(member, sep + 1)
    local entry = '{"job_id":' .. cjson.encode(job_id) .. ',"job_type":"' .. job_type .. '","enqueued_at":' .. ARGV[1] .. '}'
    redis.call('LPUSH', ARGV[2] .. job_type, entry)
  end
  redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

const DLQ_PUSH_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// 就绪队列条目是带入队时间的JSON，按 job_id 字段逐条比较
const PENDING_SCRIPT: &str = r#"
for _, raw in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  local ok, entry = pcall(cjson.decode, raw)
  if ok and entry['job_id'] == ARGV[1] then
    return 1
  end
end
if redis.call('ZSCORE', KEYS[2], ARGV[2]) then
  return 1
end
return 0
"#;

const PROMOTE_BATCH_SIZE: usize = 500;

fn map_redis_error(err: redis::RedisError) -> JobQueueError {
    JobQueueError::Store(err.to_string())
}

trait RedisResultExt<T> {
    fn store_err(self) -> JobQueueResult<T>;
}

impl<T> RedisResultExt<T> for redis::RedisResult<T> {
    fn store_err(self) -> JobQueueResult<T> {
        self.map_err(map_redis_error)
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    create_script: Script,
    transition_script: Script,
    promote_script: Script,
    dlq_push_script: Script,
    pending_script: Script,
}

impl RedisStore {
    pub async fn connect(
        redis_url: &str,
        key_prefix: &str,
        connection_timeout: Duration,
    ) -> JobQueueResult<Self> {
        let client = Client::open(redis_url).store_err()?;
        let conn = tokio::time::timeout(connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                JobQueueError::Timeout(format!("连接Redis超时: {redis_url} ({connection_timeout:?})"))
            })?
            .store_err()?;

        let store = Self {
            conn,
            prefix: key_prefix.to_string(),
            create_script: Script::new(CREATE_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            dlq_push_script: Script::new(DLQ_PUSH_SCRIPT),
            pending_script: Script::new(PENDING_SCRIPT),
        };
        store.ping().await?;

        info!(redis_url = %redis_url, key_prefix = %key_prefix, "Redis存储已连接");
        Ok(store)
    }

    pub async fn ping(&self) -> JobQueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.store_err()?;
        Ok(())
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        self.key(&format!("job:{id}"))
    }

    fn cancel_key(&self, id: &str) -> String {
        self.key(&format!("job:{id}:cancel"))
    }

    fn queue_key(&self, job_type: JobType) -> String {
        self.key(&format!("queue:{job_type}"))
    }

    fn heartbeat_key(&self, worker_id: &str) -> String {
        self.key(&format!("worker:{worker_id}:heartbeat"))
    }

    fn progress_channel(&self, id: &str) -> String {
        self.key(&format!("jobs:progress:{id}"))
    }

    async fn publish(&self, job: &Job) {
        let event = ProgressEvent::from(job);
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "序列化进度事件失败");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(self.progress_channel(&job.job_id))
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(job_id = %job.job_id, error = %e, "发布进度事件失败");
        }
    }

    async fn fetch_jobs(&self, ids: &[String]) -> JobQueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGETALL").arg(self.job_key(id));
        }

        let mut conn = self.conn.clone();
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await.store_err()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            // 索引与哈希之间可能存在外部清理留下的空洞
            if row.is_empty() {
                continue;
            }
            jobs.push(job_from_hash(row)?);
        }
        Ok(jobs)
    }
}

fn job_to_fields(job: &Job) -> JobQueueResult<Vec<(&'static str, String)>> {
    Ok(vec![
        ("job_id", job.job_id.clone()),
        ("type", job.job_type.to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("status", job.status.to_string()),
        ("progress", job.progress.to_string()),
        ("message", job.message.clone()),
        ("attempt", job.attempt.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("created_at", job.created_at.to_rfc3339()),
        ("updated_at", job.updated_at.to_rfc3339()),
        ("owner_worker_id", job.owner_worker_id.clone()),
    ])
}

fn job_from_hash(mut row: HashMap<String, String>) -> JobQueueResult<Job> {
    let mut take = |field: &str| {
        row.remove(field)
            .ok_or_else(|| JobQueueError::Serialization(format!("作业记录缺少字段: {field}")))
    };

    let parse_error = |field: &str, e: &dyn std::fmt::Display| {
        JobQueueError::Serialization(format!("作业字段 {field} 无法解析: {e}"))
    };

    let job_id = take("job_id")?;
    let job_type = take("type")?.parse::<JobType>()?;
    let payload = serde_json::from_str(&take("payload")?)?;
    let status = take("status")?.parse::<JobStatus>()?;
    let progress = take("progress")?
        .parse::<u8>()
        .map_err(|e| parse_error("progress", &e))?;
    let message = take("message")?;
    let attempt = take("attempt")?
        .parse::<u32>()
        .map_err(|e| parse_error("attempt", &e))?;
    let max_attempts = take("max_attempts")?
        .parse::<u32>()
        .map_err(|e| parse_error("max_attempts", &e))?;
    let created_at = DateTime::parse_from_rfc3339(&take("created_at")?)
        .map_err(|e| parse_error("created_at", &e))?
        .with_timezone(&Utc);
    let updated_at = DateTime::parse_from_rfc3339(&take("updated_at")?)
        .map_err(|e| parse_error("updated_at", &e))?
        .with_timezone(&Utc);
    let owner_worker_id = take("owner_worker_id").unwrap_or_default();

    Ok(Job {
        job_id,
        job_type,
        payload,
        status,
        progress,
        message,
        attempt,
        max_attempts,
        created_at,
        updated_at,
        owner_worker_id,
    })
}

#[async_trait]
impl JobStore for RedisStore {
    async fn create(&self, job: &Job) -> JobQueueResult<()> {
        let mut invocation = self.create_script.prepare_invoke();
        invocation
            .key(self.job_key(&job.job_id))
            .key(self.key("jobs:index"))
            .arg(&job.job_id)
            .arg(job.created_at.timestamp_millis());
        for (field, value) in job_to_fields(job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let created: i64 = invocation.invoke_async(&mut conn).await.store_err()?;
        if created == 0 {
            return Err(JobQueueError::DuplicateJob {
                id: job.job_id.clone(),
            });
        }

        self.publish(job).await;
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> JobQueueResult<Job> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = JobStore::get(self, id)
                .await?
                .ok_or_else(|| JobQueueError::job_not_found(id))?;
            current.check_transition(from, &update)?;

            let mut next = current.clone();
            next.apply_transition(to, &update, Utc::now())?;

            let mut invocation = self.transition_script.prepare_invoke();
            invocation
                .key(self.job_key(id))
                .key(self.key("jobs:running"))
                .arg(current.status.as_str())
                .arg(&current.owner_worker_id)
                .arg(current.updated_at.to_rfc3339())
                .arg(id)
                .arg(to.as_str());
            for (field, value) in job_to_fields(&next)? {
                invocation.arg(field).arg(value);
            }

            let mut conn = self.conn.clone();
            let outcome: i64 = invocation.invoke_async(&mut conn).await.store_err()?;
            match outcome {
                1 => {
                    self.publish(&next).await;
                    if to.is_terminal() {
                        let cleared: redis::RedisResult<i64> = redis::cmd("DEL")
                            .arg(self.cancel_key(id))
                            .query_async(&mut conn)
                            .await;
                        if let Err(e) = cleared {
                            warn!(job_id = %id, error = %e, "清除取消标记失败");
                        }
                    }
                    return Ok(next);
                }
                -1 => return Err(JobQueueError::job_not_found(id)),
                _ => {
                    debug!(job_id = %id, "CAS冲突，重新读取作业");
                }
            }
        }

        let expected = from
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("|");
        Err(JobQueueError::stale(
            id.to_string(),
            expected,
            "concurrently modified".to_string(),
        ))
    }

    async fn get(&self, id: &str) -> JobQueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let row: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await
            .store_err()?;

        if row.is_empty() {
            return Ok(None);
        }
        job_from_hash(row).map(Some)
    }

    async fn list_jobs(&self, limit: usize, job_type: Option<JobType>) -> JobQueueResult<JobPage> {
        let mut conn = self.conn.clone();
        let index = self.key("jobs:index");

        match job_type {
            None => {
                let total: usize = redis::cmd("ZCARD")
                    .arg(&index)
                    .query_async(&mut conn)
                    .await
                    .store_err()?;
                if limit == 0 {
                    return Ok(JobPage {
                        jobs: Vec::new(),
                        total,
                    });
                }
                let ids: Vec<String> = redis::cmd("ZREVRANGE")
                    .arg(&index)
                    .arg(0)
                    .arg(limit as i64 - 1)
                    .query_async(&mut conn)
                    .await
                    .store_err()?;
                let jobs = self.fetch_jobs(&ids).await?;
                Ok(JobPage { jobs, total })
            }
            Some(job_type) => {
                let ids: Vec<String> = redis::cmd("ZREVRANGE")
                    .arg(&index)
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await
                    .store_err()?;
                let matching: Vec<Job> = self
                    .fetch_jobs(&ids)
                    .await?
                    .into_iter()
                    .filter(|job| job.job_type == job_type)
                    .collect();
                let total = matching.len();
                let jobs = matching.into_iter().take(limit).collect();
                Ok(JobPage { jobs, total })
            }
        }
    }

    async fn list_running(&self) -> JobQueueResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key("jobs:running"))
            .query_async(&mut conn)
            .await
            .store_err()?;

        Ok(self
            .fetch_jobs(&ids)
            .await?
            .into_iter()
            .filter(|job| job.is_running())
            .collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> JobQueueResult<Vec<Job>> {
        if status == JobStatus::Running {
            return self.list_running().await;
        }

        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.key("jobs:index"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .store_err()?;

        Ok(self
            .fetch_jobs(&ids)
            .await?
            .into_iter()
            .filter(|job| job.status == status)
            .collect())
    }

    async fn request_cancel(&self, id: &str) -> JobQueueResult<()> {
        if JobStore::get(self, id).await?.is_none() {
            return Err(JobQueueError::job_not_found(id));
        }

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.cancel_key(id))
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(())
    }

    async fn is_cancel_requested(&self, id: &str) -> JobQueueResult<bool> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.cancel_key(id))
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(exists > 0)
    }
}

#[async_trait]
impl JobQueue for RedisStore {
    async fn enqueue(&self, job_type: JobType, job_id: &str) -> JobQueueResult<()> {
        let entry = serde_json::to_string(&QueueEntry::new(job_type, job_id))?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.queue_key(job_type))
            .arg(entry)
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(())
    }

    async fn dequeue(&self, job_type: JobType) -> JobQueueResult<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(self.queue_key(job_type))
            .query_async(&mut conn)
            .await
            .store_err()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn schedule(
        &self,
        job_type: JobType,
        job_id: &str,
        ready_at: DateTime<Utc>,
    ) -> JobQueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.key("queue:delayed"))
            .arg(ready_at.timestamp_millis())
            .arg(format!("{job_type}|{job_id}"))
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> JobQueueResult<usize> {
        let mut conn = self.conn.clone();
        let promoted: i64 = self
            .promote_script
            .key(self.key("queue:delayed"))
            .arg(now.timestamp_millis())
            .arg(self.key("queue:"))
            .arg(PROMOTE_BATCH_SIZE)
            .invoke_async(&mut conn)
            .await
            .store_err()?;
        Ok(promoted.max(0) as usize)
    }

    async fn is_pending(&self, job_type: JobType, job_id: &str) -> JobQueueResult<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = self
            .pending_script
            .key(self.queue_key(job_type))
            .key(self.key("queue:delayed"))
            .arg(job_id)
            .arg(format!("{job_type}|{job_id}"))
            .invoke_async(&mut conn)
            .await
            .store_err()?;
        Ok(found == 1)
    }

    async fn depth(&self, job_type: JobType) -> JobQueueResult<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.queue_key(job_type))
            .query_async(&mut conn)
            .await
            .store_err()
    }

    async fn delayed_depth(&self) -> JobQueueResult<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(self.key("queue:delayed"))
            .query_async(&mut conn)
            .await
            .store_err()
    }
}

#[async_trait]
impl DeadLetterQueue for RedisStore {
    async fn push(&self, entry: &DeadLetterEntry) -> JobQueueResult<bool> {
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        let pushed: i64 = self
            .dlq_push_script
            .key(self.key("dlq:entries"))
            .key(self.key("queue:dlq"))
            .arg(&entry.job_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .store_err()?;
        Ok(pushed == 1)
    }

    async fn list(&self) -> JobQueueResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("queue:dlq"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .store_err()?;
        // LPUSH 使最新条目在前，列表按进入顺序返回
        ids.reverse();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key("dlq:entries"))
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .store_err()?;

        let mut entries = Vec::with_capacity(raw.len());
        for payload in raw.into_iter().flatten() {
            entries.push(serde_json::from_str(&payload)?);
        }
        Ok(entries)
    }

    async fn remove(&self, job_id: &str) -> JobQueueResult<bool> {
        let mut conn = self.conn.clone();
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("dlq:entries"))
            .arg(job_id)
            .cmd("LREM")
            .arg(self.key("queue:dlq"))
            .arg(0)
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(removed > 0)
    }

    async fn contains(&self, job_id: &str) -> JobQueueResult<bool> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("HEXISTS")
            .arg(self.key("dlq:entries"))
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(exists == 1)
    }

    async fn depth(&self) -> JobQueueResult<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.key("queue:dlq"))
            .query_async(&mut conn)
            .await
            .store_err()
    }
}

#[async_trait]
impl HeartbeatStore for RedisStore {
    async fn record(&self, heartbeat: &WorkerHeartbeat) -> JobQueueResult<()> {
        let payload = serde_json::to_string(heartbeat)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.heartbeat_key(&heartbeat.worker_id))
            .arg(payload)
            .ignore()
            .cmd("SADD")
            .arg(self.key("workers"))
            .arg(&heartbeat.worker_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> JobQueueResult<Option<WorkerHeartbeat>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.heartbeat_key(worker_id))
            .query_async(&mut conn)
            .await
            .store_err()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> JobQueueResult<Vec<WorkerHeartbeat>> {
        let mut conn = self.conn.clone();
        let mut worker_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key("workers"))
            .query_async(&mut conn)
            .await
            .store_err()?;
        worker_ids.sort();

        if worker_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = worker_ids.iter().map(|id| self.heartbeat_key(id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .store_err()?;

        let mut heartbeats = Vec::with_capacity(raw.len());
        for payload in raw.into_iter().flatten() {
            heartbeats.push(serde_json::from_str(&payload)?);
        }
        Ok(heartbeats)
    }

    async fn remove(&self, worker_id: &str) -> JobQueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.heartbeat_key(worker_id))
            .ignore()
            .cmd("SREM")
            .arg(self.key("workers"))
            .arg(worker_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .store_err()?;
        Ok(())
    }
}
