use super::{AcquireReply, Completion, ScriptEngine, StoreError, ttl_millis};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const REDIS_URL_ENV: &str = "REDIS_URL";

// KEYS[1] slot key
// ARGV[1] processing value, ARGV[2] fingerprint, ARGV[3] processing TTL (ms)
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
  return {'FIRST'}
end
local ok, slot = pcall(cjson.decode, current)
if not ok or type(slot) ~= 'table' or slot.v ~= 1 then
  return {'CORRUPT'}
end
if slot.h ~= ARGV[2] then
  return {'MISMATCH'}
end
if slot.kind == 'processing' then
  return {'IN_FLIGHT'}
end
if slot.kind == 'done' then
  return {'DONE', current}
end
return {'CORRUPT'}
"#;

// KEYS[1] slot key
// ARGV[1] status, ARGV[2] base64 body, ARGV[3] JSON header map, ARGV[4] done TTL (ms)
const COMPLETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local ok, slot = pcall(cjson.decode, current)
if not ok or type(slot) ~= 'table' or slot.kind ~= 'processing' then
  return 0
end
local done = {
  v = 1,
  kind = 'done',
  h = slot.h,
  status = tonumber(ARGV[1]),
  body = ARGV[2],
  hdr = cjson.decode(ARGV[3]),
}
redis.call('SET', KEYS[1], cjson.encode(done), 'PX', ARGV[4])
return 1
"#;

/// Runs the slot scripts on Redis with `EVALSHA`, falling back to `EVAL`
/// when the script cache is cold.
pub struct RedisEngine {
    client: redis::Client,
    // Connected on first use so the gateway can start while Redis is down.
    connection: OnceCell<ConnectionManager>,
    acquire: Script,
    complete: Script,
}

impl RedisEngine {
    pub fn new(configured_url: Option<&str>) -> Result<Self, StoreError> {
        let env_url = std::env::var(REDIS_URL_ENV).ok();
        let url = resolve_url(configured_url, env_url.as_deref())?;
        let client = redis::Client::open(url.as_str())?;
        Ok(RedisEngine {
            client,
            connection: OnceCell::new(),
            acquire: Script::new(ACQUIRE_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                tracing::info!("connecting to redis");
                self.client.get_connection_manager().await
            })
            .await?;
        Ok(connection.clone())
    }
}

/// The configured URL wins over the environment. A bare `host:port` gets the
/// `redis://` scheme.
pub fn resolve_url(configured: Option<&str>, env: Option<&str>) -> Result<String, StoreError> {
    let url = configured
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .or_else(|| env.map(str::trim).filter(|url| !url.is_empty()))
        .ok_or_else(|| {
            StoreError::NotConfigured(format!(
                "no redis url in config and {REDIS_URL_ENV} is not set"
            ))
        })?;

    if url.contains("://") {
        Ok(url.to_string())
    } else {
        Ok(format!("redis://{url}"))
    }
}

fn parse_acquire_reply(reply: Vec<String>, slot_key: &str) -> Result<AcquireReply, StoreError> {
    let mut parts = reply.into_iter();
    match (parts.next().as_deref(), parts.next()) {
        (Some("FIRST"), None) => Ok(AcquireReply::First),
        (Some("IN_FLIGHT"), None) => Ok(AcquireReply::InFlight),
        (Some("MISMATCH"), None) => Ok(AcquireReply::Mismatch),
        (Some("DONE"), Some(raw)) => Ok(AcquireReply::Done(raw)),
        (Some("CORRUPT"), _) => Err(StoreError::CorruptSlot(format!(
            "unreadable value under {slot_key}"
        ))),
        (tag, _) => Err(StoreError::UnexpectedReply(format!("acquire returned {tag:?}"))),
    }
}

#[async_trait]
impl ScriptEngine for RedisEngine {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(
        &self,
        slot_key: &str,
        processing: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<AcquireReply, StoreError> {
        let mut connection = self.connection().await?;
        let reply: Vec<String> = self
            .acquire
            .key(slot_key)
            .arg(processing)
            .arg(fingerprint)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        parse_acquire_reply(reply, slot_key)
    }

    async fn complete(
        &self,
        slot_key: &str,
        completion: Completion<'_>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let headers = serde_json::to_string(completion.headers)
            .map_err(|e| StoreError::CorruptSlot(e.to_string()))?;
        let mut connection = self.connection().await?;
        let written: i64 = self
            .complete
            .key(slot_key)
            .arg(completion.status)
            .arg(completion.body)
            .arg(headers)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(written == 1)
    }

    async fn delete(&self, slot_key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(slot_key)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }
}
