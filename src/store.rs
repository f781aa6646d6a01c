//! Persistence boundary. The administrative surface owns the real schema;
//! the core only needs the handful of reads and row updates below, expressed
//! as a trait so the collaborator can be swapped. `MemStore` backs tests and
//! single-node development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{RelayError, Result};
use crate::model::{Channel, ChannelId, ConsumeLog, Token, TokenId, User, UserId};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn token_by_key(&self, key: &str) -> Result<Option<Token>>;
    async fn token(&self, id: TokenId) -> Result<Option<Token>>;
    /// Fails with a quota error when the remaining balance cannot cover
    /// `amount`. Single-row update; concurrent callers serialize on the row.
    async fn decrease_token_quota(&self, id: TokenId, amount: i64) -> Result<()>;
    async fn increase_token_quota(&self, id: TokenId, amount: i64) -> Result<()>;

    async fn user(&self, id: UserId) -> Result<Option<User>>;
    async fn decrease_user_quota(&self, id: UserId, amount: i64) -> Result<()>;
    async fn increase_user_quota(&self, id: UserId, amount: i64) -> Result<()>;
    async fn add_user_used_quota(&self, id: UserId, amount: i64) -> Result<()>;

    async fn channels(&self) -> Result<Vec<Channel>>;
    async fn channel(&self, id: ChannelId) -> Result<Option<Channel>>;
    async fn add_channel_used_quota(&self, id: ChannelId, amount: i64) -> Result<()>;

    async fn insert_consume_log(&self, log: ConsumeLog) -> Result<()>;

    /// Key/value options table maintained by the administrative surface;
    /// read-only for the core (pricing tables, feature toggles).
    async fn options(&self) -> Result<HashMap<String, String>>;
}

fn row_missing(what: &str) -> RelayError {
    RelayError::internal("record_not_found", format!("{what} not found"))
}

#[derive(Default)]
struct MemInner {
    tokens: HashMap<TokenId, Token>,
    users: HashMap<UserId, User>,
    channels: HashMap<ChannelId, Channel>,
    logs: Vec<ConsumeLog>,
    options: HashMap<String, String>,
}

/// In-memory store. The single write lock stands in for row locks: settle
/// races on one token linearize through it.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_token(&self, token: Token) {
        self.inner.write().await.tokens.insert(token.id, token);
    }

    pub async fn put_user(&self, user: User) {
        self.inner.write().await.users.insert(user.id, user);
    }

    pub async fn put_channel(&self, channel: Channel) {
        self.inner.write().await.channels.insert(channel.id, channel);
    }

    pub async fn consume_logs(&self) -> Vec<ConsumeLog> {
        self.inner.read().await.logs.clone()
    }

    pub async fn put_option(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .write()
            .await
            .options
            .insert(key.into(), value.into());
    }
}

#[async_trait]
impl Store for MemStore {
    async fn token_by_key(&self, key: &str) -> Result<Option<Token>> {
        let inner = self.inner.read().await;
        Ok(inner.tokens.values().find(|t| t.key == key).cloned())
    }

    async fn token(&self, id: TokenId) -> Result<Option<Token>> {
        Ok(self.inner.read().await.tokens.get(&id).cloned())
    }

    async fn decrease_token_quota(&self, id: TokenId, amount: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let token = inner.tokens.get_mut(&id).ok_or_else(|| row_missing("token"))?;
        if token.unlimited_quota {
            return Ok(());
        }
        if token.remaining_quota < amount {
            return Err(RelayError::Quota {
                code: "pre_consume_token_quota_failed",
                message: "token quota is not enough".to_string(),
            });
        }
        token.remaining_quota -= amount;
        Ok(())
    }

    async fn increase_token_quota(&self, id: TokenId, amount: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let token = inner.tokens.get_mut(&id).ok_or_else(|| row_missing("token"))?;
        if !token.unlimited_quota {
            token.remaining_quota += amount;
        }
        Ok(())
    }

    async fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn decrease_user_quota(&self, id: UserId, amount: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or_else(|| row_missing("user"))?;
        user.quota -= amount;
        Ok(())
    }

    async fn increase_user_quota(&self, id: UserId, amount: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or_else(|| row_missing("user"))?;
        user.quota += amount;
        Ok(())
    }

    async fn add_user_used_quota(&self, id: UserId, amount: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or_else(|| row_missing("user"))?;
        user.used_quota += amount;
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<Channel>> {
        Ok(self.inner.read().await.channels.values().cloned().collect())
    }

    async fn channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        Ok(self.inner.read().await.channels.get(&id).cloned())
    }

    async fn add_channel_used_quota(&self, id: ChannelId, amount: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .channels
            .get_mut(&id)
            .ok_or_else(|| row_missing("channel"))?;
        channel.used_quota += amount;
        Ok(())
    }

    async fn insert_consume_log(&self, log: ConsumeLog) -> Result<()> {
        self.inner.write().await.logs.push(log);
        Ok(())
    }

    async fn options(&self) -> Result<HashMap<String, String>> {
        Ok(self.inner.read().await.options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TokenStatus;

    fn token(id: TokenId, quota: i64) -> Token {
        Token {
            id,
            user_id: 1,
            name: "test".into(),
            key: format!("key-{id}"),
            status: TokenStatus::Enabled,
            remaining_quota: quota,
            unlimited_quota: false,
            expired_at: None,
        }
    }

    #[tokio::test]
    async fn token_quota_floor() {
        let store = MemStore::new();
        store.put_token(token(1, 10)).await;

        store.decrease_token_quota(1, 10).await.unwrap();
        let err = store.decrease_token_quota(1, 1).await.unwrap_err();
        assert!(matches!(err, RelayError::Quota { .. }));
        assert_eq!(store.token(1).await.unwrap().unwrap().remaining_quota, 0);
    }

    #[tokio::test]
    async fn concurrent_settles_linearize() {
        let store = MemStore::new();
        store.put_token(token(1, 1000)).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.decrease_token_quota(1, 7).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            store.token(1).await.unwrap().unwrap().remaining_quota,
            1000 - 10 * 7
        );
    }

    #[tokio::test]
    async fn unlimited_token_never_decrements() {
        let store = MemStore::new();
        let mut t = token(2, 0);
        t.unlimited_quota = true;
        store.put_token(t).await;
        store.decrease_token_quota(2, 100).await.unwrap();
        assert_eq!(store.token(2).await.unwrap().unwrap().remaining_quota, 0);
    }
}
