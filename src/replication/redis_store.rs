use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::store::{SharedStore, StoreMessage};
use super::ReplicationResult;

const HASH_MAX_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
local candidate = tonumber(ARGV[2])
if candidate > current then
  redis.call('HSET', KEYS[1], ARGV[1], candidate)
  return candidate
end
return current
"#;

const RELEASE_MEMBER_SCRIPT: &str = r#"
local remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if remaining < 0 then
  redis.call('HSET', KEYS[1], ARGV[1], 0)
  remaining = 0
end
if remaining == 0 then
  redis.call('SREM', KEYS[2], ARGV[2])
end
return remaining
"#;

/// [`SharedStore`] over Redis: one multiplexed connection for commands, and a
/// dedicated pub/sub connection per `listen` call.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    hash_max: Script,
    release_member: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> ReplicationResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            client,
            conn,
            hash_max: Script::new(HASH_MAX_SCRIPT),
            release_member: Script::new(RELEASE_MEMBER_SCRIPT),
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hash_get(&self, key: &str, field: &str) -> ReplicationResult<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> ReplicationResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_max(&self, key: &str, field: &str, value: i64) -> ReplicationResult<i64> {
        let mut conn = self.conn.clone();
        let stored: i64 = self
            .hash_max
            .key(key)
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(stored)
    }

    async fn release_member(
        &self,
        key: &str,
        field: &str,
        set_key: &str,
        member: &str,
    ) -> ReplicationResult<i64> {
        let mut conn = self.conn.clone();
        let remaining: i64 = self
            .release_member
            .key(key)
            .key(set_key)
            .arg(field)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    async fn set_add(&self, key: &str, member: &str) -> ReplicationResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> ReplicationResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: String) -> ReplicationResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn listen(
        &self,
        pattern: &str,
    ) -> ReplicationResult<mpsc::UnboundedReceiver<StoreMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_owned();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("dropping undecodable pub/sub payload: {err}");
                        continue;
                    }
                };
                let forwarded = StoreMessage {
                    channel: message.get_channel_name().to_owned(),
                    payload,
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            if tx.is_closed() {
                debug!("pub/sub listener for {pattern} stopped");
            } else {
                warn!("pub/sub connection for {pattern} dropped");
            }
        });
        Ok(rx)
    }
}
