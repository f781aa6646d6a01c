//! Shared key-value layer over redis: quota cache, cache locks, the leader
//! lease, and pub/sub. Absent redis the gateway degrades to direct store
//! reads, a static leader role and no realtime sync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct SharedKv {
    conn: Arc<Mutex<ConnectionManager>>,
    client: redis::Client,
}

impl SharedKv {
    pub async fn maybe_new(url: Option<&str>) -> anyhow::Result<Option<Self>> {
        let Some(url) = url else {
            return Ok(None);
        };
        let client = redis::Client::open(url)
            .with_context(|| format!("failed to create redis client for {url}"))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to redis")?;
        Ok(Some(Self {
            conn: Arc::new(Mutex::new(conn)),
            client,
        }))
    }

    /// Fresh client handle for connections the manager cannot multiplex
    /// (pub/sub subscribers hold their connection exclusively).
    pub fn client(&self) -> redis::Client {
        self.client.clone()
    }

    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>, redis::RedisError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("GET").arg(key).query_async(&mut *conn).await
    }

    pub async fn set_ex(
        &self,
        key: &str,
        value: impl redis::ToRedisArgs,
        ttl: Duration,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs())
            .arg(value)
            .query_async(&mut *conn)
            .await
    }

    /// SET key value NX PX ttl; true when the key was claimed.
    pub async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.lock().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL").arg(key).query_async(&mut *conn).await
    }

    pub async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, redis::RedisError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DECRBY")
            .arg(key)
            .arg(amount)
            .query_async(&mut *conn)
            .await
    }

    pub async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, redis::RedisError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("INCRBY")
            .arg(key)
            .arg(amount)
            .query_async(&mut *conn)
            .await
    }

    /// Runs a server-side script; the election renew path depends on this
    /// being atomic on the redis side.
    pub async fn eval_i64(
        &self,
        script: &redis::Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<i64, redis::RedisError> {
        let mut conn = self.conn.lock().await;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        invocation.invoke_async(&mut *conn).await
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut *conn)
            .await
    }
}
