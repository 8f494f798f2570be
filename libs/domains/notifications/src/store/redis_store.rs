//! Redis-backed stores.
//!
//! Key layout under a configurable prefix (default `notifications`):
//!
//! | Key | Type | Contents |
//! |---|---|---|
//! | `{p}:ready` | LIST | ready job ids (`LPUSH` in, `RPOP` out) |
//! | `{p}:delayed` | ZSET | job ids scored by ready-at millis |
//! | `{p}:inflight` | ZSET | claimed job ids scored by lease deadline millis |
//! | `{p}:dlq` | STREAM | dead-letter entries, field `data` |
//! | `{p}:dlq:index` | HASH | job id -> latest dead-letter entry |
//! | `{p}:job:{id}` | HASH | `doc` (JSON record) + `version` |
//! | `{p}:jobs` | ZSET | job ids scored by creation millis |
//!
//! Every multi-key step runs as a Lua script or a MULTI pipeline so it is
//! atomic with respect to other workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::{
    CREATED_VERSION, JobMutation, JobStore, QueueStore, apply_update, describe, page_limit,
};
use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    DeadLetterEntry, JobFilter, JobId, NotificationJob, Page, Precondition, QueueStats,
};

// Type alias for Redis stream entries
type StreamEntries = Vec<(String, Vec<(String, String)>)>;

const MAX_PAGE_SIZE: usize = 1000;
const RECLAIM_BATCH: usize = 1000;

/// Pop one ready id and, if a deadline is given, lease it in the same step.
static CLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local id = redis.call('RPOP', KEYS[1])
        if not id then
            return false
        end
        if ARGV[1] ~= '' then
            redis.call('ZADD', KEYS[2], ARGV[1], id)
        end
        return id
        ",
    )
});

/// Move due delayed ids to the ready list.
static PROMOTE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('LPUSH', KEYS[2], id)
        end
        return due
        ",
    )
});

/// Remove and return expired leases.
static RECLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
        if #expired > 0 then
            redis.call('ZREM', KEYS[1], unpack(expired))
        end
        return expired
        ",
    )
});

/// Move a lease deadline, only while the id is still in flight.
static RENEW_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
        return 1
        ",
    )
});

/// Insert a record unless the id is taken.
static CREATE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return 0
        end
        redis.call('HSET', KEYS[1], 'doc', ARGV[1], 'version', ARGV[2])
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
        return 1
        ",
    )
});

/// Compare-and-swap on the record version: -1 missing, 0 stale, 1 written.
static CAS_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('HGET', KEYS[1], 'version')
        if not current then
            return -1
        end
        if current ~= ARGV[1] then
            return 0
        end
        redis.call('HSET', KEYS[1], 'doc', ARGV[2], 'version', ARGV[3])
        return 1
        ",
    )
});

/// Delete a record still at the given version: 1 deleted, 0 otherwise.
static WITHDRAW_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[1], 'version') ~= ARGV[1] then
            return 0
        end
        redis.call('DEL', KEYS[1])
        redis.call('ZREM', KEYS[2], ARGV[2])
        return 1
        ",
    )
});

/// Key names derived from a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
    pub ready: String,
    pub delayed: String,
    pub inflight: String,
    pub dlq: String,
    pub dlq_index: String,
    pub jobs: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            ready: format!("{prefix}:ready"),
            delayed: format!("{prefix}:delayed"),
            inflight: format!("{prefix}:inflight"),
            dlq: format!("{prefix}:dlq"),
            dlq_index: format!("{prefix}:dlq:index"),
            jobs: format!("{prefix}:jobs"),
            prefix,
        }
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }
}

fn parse_offset(cursor: Option<&str>) -> NotificationResult<isize> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse::<isize>()
            .ok()
            .filter(|offset| *offset >= 0)
            .ok_or_else(|| NotificationError::Validation(format!("invalid cursor '{raw}'"))),
    }
}

/// Stream entry ids look like `<millis>-<seq>`.
fn is_stream_id(raw: &str) -> bool {
    match raw.split_once('-') {
        Some((millis, seq)) => {
            !millis.is_empty()
                && !seq.is_empty()
                && millis.bytes().all(|b| b.is_ascii_digit())
                && seq.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

// ============================================================================
// Job records
// ============================================================================

#[derive(Clone)]
pub struct RedisJobStore {
    redis: ConnectionManager,
    keys: RedisKeys,
}

impl RedisJobStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            keys: RedisKeys::new(prefix),
        }
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn load(&self, id: &JobId) -> NotificationResult<Option<NotificationJob>> {
        let mut conn = self.redis.clone();
        let doc: Option<String> = conn.hget(self.keys.job(id), "doc").await?;
        doc.map(|raw| serde_json::from_str(&raw).map_err(NotificationError::from))
            .transpose()
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, mut job: NotificationJob) -> NotificationResult<JobId> {
        job.version = CREATED_VERSION;
        let doc = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();

        let created: i64 = CREATE_SCRIPT
            .key(self.keys.job(&job.id))
            .key(&self.keys.jobs)
            .arg(doc)
            .arg(job.version)
            .arg(job.created_at.timestamp_millis())
            .arg(job.id.as_str())
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(NotificationError::DuplicateJob(job.id));
        }
        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> NotificationResult<NotificationJob> {
        self.load(id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(id.clone()))
    }

    async fn update(
        &self,
        id: &JobId,
        expected: Precondition,
        mutation: JobMutation,
    ) -> NotificationResult<NotificationJob> {
        let current = self.get(id).await?;
        let next = apply_update(&current, &expected, mutation)?;
        let doc = serde_json::to_string(&next)?;
        let mut conn = self.redis.clone();

        let written: i64 = CAS_SCRIPT
            .key(self.keys.job(id))
            .arg(current.version)
            .arg(doc)
            .arg(next.version)
            .invoke_async(&mut conn)
            .await?;

        match written {
            1 => Ok(next),
            -1 => Err(NotificationError::NotFound(id.clone())),
            _ => {
                debug!(job_id = %id, version = current.version, "Record changed during update");
                Err(NotificationError::Conflict {
                    job_id: id.clone(),
                    expected: describe(expected.status, expected.attempt),
                    actual: format!("version newer than {}", current.version),
                })
            }
        }
    }

    async fn list(&self, filter: &JobFilter) -> NotificationResult<Page<NotificationJob>> {
        let limit = page_limit(filter.limit, MAX_PAGE_SIZE);
        let batch = limit.max(50) as isize;
        let mut offset = parse_offset(filter.cursor.as_deref())?;
        let mut conn = self.redis.clone();

        let mut items = Vec::with_capacity(limit);
        loop {
            let ids: Vec<String> = conn
                .zrange(&self.keys.jobs, offset, offset + batch - 1)
                .await?;
            if ids.is_empty() {
                return Ok(Page {
                    items,
                    next_cursor: None,
                });
            }

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.hget(self.keys.job(&JobId::from(id.as_str())), "doc");
            }
            let docs: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

            for (position, doc) in docs.into_iter().enumerate() {
                let Some(raw) = doc else {
                    continue;
                };
                let job: NotificationJob = serde_json::from_str(&raw)?;
                if filter.status.is_some_and(|s| s != job.status) {
                    continue;
                }
                if items.len() == limit {
                    return Ok(Page {
                        items,
                        next_cursor: Some((offset + position as isize).to_string()),
                    });
                }
                items.push(job);
            }

            offset += ids.len() as isize;
        }
    }

    async fn withdraw(&self, id: &JobId, version: u64) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let deleted: i64 = WITHDRAW_SCRIPT
            .key(self.keys.job(id))
            .key(&self.keys.jobs)
            .arg(version)
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

// ============================================================================
// Queue structures
// ============================================================================

#[derive(Clone)]
pub struct RedisQueueStore {
    redis: ConnectionManager,
    keys: RedisKeys,
}

impl RedisQueueStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            keys: RedisKeys::new(prefix),
        }
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue_ready(&self, id: &JobId) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(&self.keys.delayed, id.as_str())
            .ignore()
            .lrem(&self.keys.ready, 0, id.as_str())
            .ignore()
            .lpush(&self.keys.ready, id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn enqueue_delayed(&self, id: &JobId, ready_at: DateTime<Utc>) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.keys.ready, 0, id.as_str())
            .ignore()
            .zadd(&self.keys.delayed, id.as_str(), ready_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_ready(
        &self,
        lease_until: Option<DateTime<Utc>>,
    ) -> NotificationResult<Option<JobId>> {
        let lease = lease_until
            .map(|until| until.timestamp_millis().to_string())
            .unwrap_or_default();
        let mut conn = self.redis.clone();

        let claimed: Option<String> = CLAIM_SCRIPT
            .key(&self.keys.ready)
            .key(&self.keys.inflight)
            .arg(lease)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed.map(JobId::from))
    }

    async fn promote_due_delayed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> NotificationResult<Vec<JobId>> {
        let mut conn = self.redis.clone();
        let promoted: Vec<String> = PROMOTE_SCRIPT
            .key(&self.keys.delayed)
            .key(&self.keys.ready)
            .arg(now.timestamp_millis())
            .arg(limit.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted.into_iter().map(JobId::from).collect())
    }

    async fn release(&self, id: &JobId) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.zrem(&self.keys.inflight, id.as_str()).await?;
        Ok(())
    }

    async fn renew_lease(&self, id: &JobId, until: DateTime<Utc>) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let renewed: i64 = RENEW_SCRIPT
            .key(&self.keys.inflight)
            .arg(id.as_str())
            .arg(until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> NotificationResult<Vec<JobId>> {
        let mut conn = self.redis.clone();
        let expired: Vec<String> = RECLAIM_SCRIPT
            .key(&self.keys.inflight)
            .arg(now.timestamp_millis())
            .arg(RECLAIM_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(expired.into_iter().map(JobId::from).collect())
    }

    async fn discard(&self, id: &JobId) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.keys.ready, 0, id.as_str())
            .ignore()
            .zrem(&self.keys.delayed, id.as_str())
            .ignore()
            .zrem(&self.keys.inflight, id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn enqueue_dead_letter(&self, entry: &DeadLetterEntry) -> NotificationResult<()> {
        let data = serde_json::to_string(entry)?;
        let mut conn = self.redis.clone();

        let _: () = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.keys.dlq)
            .arg("*")
            .arg("data")
            .arg(&data)
            .ignore()
            .hset(&self.keys.dlq_index, entry.job_id().as_str(), &data)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> NotificationResult<Page<DeadLetterEntry>> {
        let limit = page_limit(limit, MAX_PAGE_SIZE);
        if let Some(raw) = cursor
            && !is_stream_id(raw)
        {
            return Err(NotificationError::Validation(format!("invalid cursor '{raw}'")));
        }
        let start = cursor
            .map(|id| format!("({id}"))
            .unwrap_or_else(|| "-".to_string());
        let mut conn = self.redis.clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.keys.dlq)
            .arg(&start)
            .arg("+")
            .arg("COUNT")
            .arg(limit + 1)
            .query_async(&mut conn)
            .await?;

        let has_more = entries.len() > limit;
        let mut items = Vec::with_capacity(limit);
        let mut last_id = None;

        for (stream_id, fields) in entries.into_iter().take(limit) {
            if let Some(data) = fields.iter().find(|(k, _)| k == "data").map(|(_, v)| v) {
                match serde_json::from_str::<DeadLetterEntry>(data) {
                    Ok(entry) => items.push(entry),
                    Err(e) => warn!(stream_id = %stream_id, error = %e, "Skipping unreadable dead-letter entry"),
                }
            }
            last_id = Some(stream_id);
        }

        Ok(Page {
            items,
            next_cursor: if has_more { last_id } else { None },
        })
    }

    async fn get_dead_letter(&self, id: &JobId) -> NotificationResult<Option<DeadLetterEntry>> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(&self.keys.dlq_index, id.as_str()).await?;
        data.map(|raw| serde_json::from_str(&raw).map_err(NotificationError::from))
            .transpose()
    }

    async fn stats(&self) -> NotificationResult<QueueStats> {
        let mut conn = self.redis.clone();
        let (ready, delayed, in_flight, dead_letters): (u64, u64, u64, u64) = redis::pipe()
            .llen(&self.keys.ready)
            .zcard(&self.keys.delayed)
            .zcard(&self.keys.inflight)
            .xlen(&self.keys.dlq)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            ready,
            delayed,
            in_flight,
            dead_letters,
        })
    }
}
