use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::store::{Entry, KvStore, StoreError};

/// Each key is a hash `{owner, data}` with a millisecond expiry, so the
/// conditional scripts only ever compare the `owner` field.
const PUT_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'data', ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

const PUT_IF_VACANT_OR_OWNED_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'owner')
if cur and cur ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'data', ARGV[2])
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[3]))
return 1
"#;

const PUT_IF_OWNED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'data', ARGV[2])
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[3]))
return 1
"#;

const DELETE_IF_OWNED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 200;

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(format!("redis: {}", e))
}

/// Escape glob metacharacters so a key prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Shared store for multi-host fleets.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(backend)
    }

    async fn eval(&self, script: &str, key: &str, args: &[String]) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(1).arg(key);
        for a in args {
            cmd.arg(a);
        }
        self.query(cmd).await
    }

    async fn read_hash(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key).arg("owner").arg("data");
        let (owner, data): (Option<String>, Option<String>) = self.query(cmd).await?;
        Ok(owner.map(|owner| Entry {
            owner,
            data: data.unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.read_hash(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Entry)>, StoreError> {
        let pattern = escape_glob(prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.query(cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        // A key may expire between SCAN and HMGET; it is simply skipped.
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.read_hash(&key).await? {
                results.push((key, entry));
            }
        }
        Ok(results)
    }

    async fn put(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let ttl_ms = ttl.map(ttl_millis).unwrap_or(0);
        let args = [entry.owner.clone(), entry.data.clone(), ttl_ms.to_string()];
        self.eval(PUT_SCRIPT, key, &args).await?;
        Ok(())
    }

    async fn put_if_vacant_or_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let args = [
            entry.owner.clone(),
            entry.data.clone(),
            ttl_millis(ttl).to_string(),
        ];
        Ok(self.eval(PUT_IF_VACANT_OR_OWNED_SCRIPT, key, &args).await? == 1)
    }

    async fn put_if_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let args = [
            entry.owner.clone(),
            entry.data.clone(),
            ttl_millis(ttl).to_string(),
        ];
        Ok(self.eval(PUT_IF_OWNED_SCRIPT, key, &args).await? == 1)
    }

    async fn delete_if_owned(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let args = [owner.to_string()];
        Ok(self.eval(DELETE_IF_OWNED_SCRIPT, key, &args).await? == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }
}
