//! Token/quota ledger: preconsumption before dispatch, settlement after,
//! with a KV-cached view of user quota and optional batched channel
//! used-quota updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{RelayError, Result};
use crate::kv::SharedKv;
use crate::model::{ChannelId, ConsumeLog, RelayMode, Token, TokenId, UserId};
use crate::store::Store;

const USER_QUOTA_CACHE_TTL: Duration = Duration::from_secs(60);

/// Everything settlement needs, captured before dispatch so the detached
/// settle task owns its inputs.
#[derive(Debug, Clone)]
pub struct SettleTicket {
    pub user_id: UserId,
    pub token_id: TokenId,
    pub token_name: String,
    pub channel_id: ChannelId,
    pub mode: RelayMode,
    /// Original (pre-mapping) model name; pricing is keyed on it.
    pub model: String,
    pub stream: bool,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    pub preconsumed: i64,
}

pub struct QuotaLedger {
    store: Arc<dyn Store>,
    kv: Option<SharedKv>,
    pre_consumed_floor: i64,
    batch: Option<Mutex<HashMap<ChannelId, i64>>>,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn Store>,
        kv: Option<SharedKv>,
        pre_consumed_floor: i64,
        batch_updates: bool,
    ) -> Self {
        Self {
            store,
            kv,
            pre_consumed_floor,
            batch: batch_updates.then(|| Mutex::new(HashMap::new())),
        }
    }

    /// Estimate the preconsume amount for a request.
    pub fn estimate(
        &self,
        prompt_tokens: u32,
        max_tokens: Option<u32>,
        ratio: f64,
    ) -> i64 {
        let tokens = match max_tokens {
            Some(max) if max > 0 => i64::from(prompt_tokens) + i64::from(max),
            _ => self.pre_consumed_floor,
        };
        ((tokens as f64) * ratio).ceil() as i64
    }

    /// Cached user quota; falls back to the store and write-through on miss.
    pub async fn cached_user_quota(&self, user_id: UserId) -> Result<i64> {
        let key = cache_key(user_id);
        if let Some(kv) = &self.kv {
            match kv.get_i64(&key).await {
                Ok(Some(quota)) => return Ok(quota),
                Ok(None) => {}
                Err(e) => warn!(error = %e, user_id, "user quota cache read failed"),
            }
        }
        let quota = self.persisted_user_quota(user_id).await?;
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.set_ex(&key, quota, USER_QUOTA_CACHE_TTL).await {
                warn!(error = %e, user_id, "user quota cache write failed");
            }
        }
        Ok(quota)
    }

    pub async fn refresh_user_quota_cache(&self, user_id: UserId) -> Result<()> {
        let quota = self.persisted_user_quota(user_id).await?;
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.set_ex(&cache_key(user_id), quota, USER_QUOTA_CACHE_TTL).await {
                warn!(error = %e, user_id, "user quota cache refresh failed");
            }
        }
        Ok(())
    }

    async fn persisted_user_quota(&self, user_id: UserId) -> Result<i64> {
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or_else(|| RelayError::Quota {
                code: "insufficient_user_quota",
                message: "user quota could not be read".to_string(),
            })?;
        Ok(user.quota)
    }

    /// Tentatively deducts quota before dispatch. Returns the amount actually
    /// recorded: 0 when the caller's balance dwarfs the estimate (trusted) or
    /// the full estimate otherwise.
    pub async fn preconsume(&self, token: &Token, estimate: i64) -> Result<i64> {
        if estimate <= 0 {
            return Ok(0);
        }
        let user_quota = self.cached_user_quota(token.user_id).await?;
        if user_quota < estimate {
            return Err(RelayError::Quota {
                code: "insufficient_user_quota",
                message: "user quota is not enough".to_string(),
            });
        }
        if user_quota > 100 * estimate {
            // caller is trusted, settlement will charge the real amount
            return Ok(0);
        }
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.decr_by(&cache_key(token.user_id), estimate).await {
                warn!(error = %e, user_id = token.user_id, "user quota cache decrement failed");
            }
        }
        self.store.decrease_token_quota(token.id, estimate).await?;
        Ok(estimate)
    }

    /// Settlement after the upstream call. `prompt_tokens`/`completion_tokens`
    /// come from the response adapter. Never called with client-malformed
    /// failures (no preconsumption happened there).
    pub async fn settle(
        &self,
        ticket: &SettleTicket,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<i64> {
        let quota = compute_quota(
            prompt_tokens,
            completion_tokens,
            ticket.model_ratio * ticket.group_ratio,
            ticket.completion_ratio,
        );
        let delta = quota - ticket.preconsumed;

        if delta != 0 {
            if delta > 0 {
                self.store.decrease_token_quota(ticket.token_id, delta).await?;
            } else {
                self.store.increase_token_quota(ticket.token_id, -delta).await?;
            }
            if let Some(kv) = &self.kv {
                if let Err(e) = kv.decr_by(&cache_key(ticket.user_id), delta).await {
                    warn!(error = %e, user_id = ticket.user_id, "user quota cache settle failed");
                }
            }
        }
        self.store.decrease_user_quota(ticket.user_id, quota).await?;
        self.store.add_user_used_quota(ticket.user_id, quota).await?;
        self.add_channel_quota(ticket.channel_id, quota).await?;

        self.store
            .insert_consume_log(ConsumeLog {
                user_id: ticket.user_id,
                token_id: ticket.token_id,
                token_name: ticket.token_name.clone(),
                channel_id: ticket.channel_id,
                mode: ticket.mode,
                model: ticket.model.clone(),
                stream: ticket.stream,
                prompt_tokens,
                completion_tokens,
                quota,
                content: format!(
                    "model ratio {:.4}, group ratio {:.4}, completion ratio {:.4}",
                    ticket.model_ratio, ticket.group_ratio, ticket.completion_ratio
                ),
                created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            })
            .await?;

        info!(
            user_id = ticket.user_id,
            channel_id = ticket.channel_id,
            model = %ticket.model,
            quota,
            delta,
            "settled relay call"
        );
        Ok(quota)
    }

    /// Fire-and-forget refund of a preconsumed amount after an upstream
    /// error. Failures are logged, never propagated.
    pub fn refund_detached(self: &Arc<Self>, token_id: TokenId, user_id: UserId, amount: i64) {
        if amount <= 0 {
            return;
        }
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = ledger.store.increase_token_quota(token_id, amount).await {
                error!(error = %e, token_id, amount, "preconsume refund failed");
                return;
            }
            if let Some(kv) = &ledger.kv {
                if let Err(e) = kv.incr_by(&cache_key(user_id), amount).await {
                    warn!(error = %e, user_id, "user quota cache refund failed");
                }
            }
        });
    }

    async fn add_channel_quota(&self, channel_id: ChannelId, quota: i64) -> Result<()> {
        if quota == 0 {
            return Ok(());
        }
        match &self.batch {
            Some(batch) => {
                *batch.lock().await.entry(channel_id).or_insert(0) += quota;
                Ok(())
            }
            None => self.store.add_channel_used_quota(channel_id, quota).await,
        }
    }

    /// Flushes the coalesced channel used-quota accumulator. Spawned on an
    /// interval when `BatchUpdateEnabled` is on.
    pub async fn flush_batch(&self) {
        let Some(batch) = &self.batch else {
            return;
        };
        let drained: Vec<(ChannelId, i64)> = {
            let mut pending = batch.lock().await;
            pending.drain().collect()
        };
        for (channel_id, amount) in drained {
            if let Err(e) = self.store.add_channel_used_quota(channel_id, amount).await {
                error!(error = %e, channel_id, amount, "batched channel quota flush failed");
            }
        }
    }
}

fn cache_key(user_id: UserId) -> String {
    format!("user_quota:{user_id}")
}

/// Billing formula. Zero total tokens bills zero; a non-zero call with a
/// non-zero ratio never bills less than one unit.
pub fn compute_quota(
    prompt_tokens: u32,
    completion_tokens: u32,
    ratio: f64,
    completion_ratio: f64,
) -> i64 {
    let total = prompt_tokens + completion_tokens;
    if total == 0 {
        return 0;
    }
    let raw = (f64::from(prompt_tokens) + f64::from(completion_tokens) * completion_ratio) * ratio;
    let mut quota = raw.ceil() as i64;
    if quota <= 0 && ratio > 0.0 {
        quota = 1;
    }
    quota
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TokenStatus, User};
    use crate::store::MemStore;

    fn ticket(preconsumed: i64) -> SettleTicket {
        SettleTicket {
            user_id: 1,
            token_id: 1,
            token_name: "test".into(),
            channel_id: 7,
            mode: RelayMode::ChatCompletions,
            model: "gpt-3.5-turbo".into(),
            stream: false,
            model_ratio: 0.5,
            group_ratio: 1.0,
            completion_ratio: 1.0,
            preconsumed,
        }
    }

    async fn seeded() -> (Arc<QuotaLedger>, MemStore) {
        let store = MemStore::new();
        store
            .put_user(User {
                id: 1,
                username: "u".into(),
                group: "default".into(),
                quota: 100_000,
                used_quota: 0,
                is_admin: false,
            })
            .await;
        store
            .put_token(Token {
                id: 1,
                user_id: 1,
                name: "test".into(),
                key: "k".into(),
                status: TokenStatus::Enabled,
                remaining_quota: 10_000,
                unlimited_quota: false,
                expired_at: None,
            })
            .await;
        store
            .put_channel(crate::model::Channel {
                id: 7,
                name: "c".into(),
                kind: crate::model::ProviderKind::OpenAi,
                key: "k".into(),
                base_url: None,
                status: crate::model::ChannelStatus::Enabled,
                weight: 1,
                priority: 0,
                async_fanout: 1,
                model_mapping: Default::default(),
                models: vec![],
                groups: vec![],
                api_version: None,
                used_quota: 0,
            })
            .await;
        let ledger = Arc::new(QuotaLedger::new(Arc::new(store.clone()), None, 500, false));
        (ledger, store)
    }

    #[test]
    fn quota_formula_edges() {
        // zero tokens bills zero even with a positive ratio
        assert_eq!(compute_quota(0, 0, 0.5, 1.0), 0);
        // tiny call rounds up to one unit
        assert_eq!(compute_quota(1, 0, 0.0001, 1.0), 1);
        // zero ratio bills zero
        assert_eq!(compute_quota(100, 100, 0.0, 1.0), 0);
        // ordinary case ceils
        assert_eq!(compute_quota(10, 10, 0.5, 2.0), 15);
    }

    #[tokio::test]
    async fn estimate_uses_floor_without_max_tokens() {
        let (ledger, _) = seeded().await;
        assert_eq!(ledger.estimate(100, None, 1.0), 500);
        assert_eq!(ledger.estimate(100, Some(0), 1.0), 500);
        assert_eq!(ledger.estimate(100, Some(50), 1.0), 150);
        assert_eq!(ledger.estimate(100, Some(50), 0.5), 75);
    }

    #[tokio::test]
    async fn trusted_caller_skips_preconsume() {
        let (ledger, store) = seeded().await;
        let token = store.token(1).await.unwrap().unwrap();
        // 100_000 > 100 * 100, so nothing is recorded
        let recorded = ledger.preconsume(&token, 100).await.unwrap();
        assert_eq!(recorded, 0);
        assert_eq!(store.token(1).await.unwrap().unwrap().remaining_quota, 10_000);
    }

    #[tokio::test]
    async fn preconsume_decrements_and_settle_refunds_difference() {
        let (ledger, store) = seeded().await;
        let token = store.token(1).await.unwrap().unwrap();
        let recorded = ledger.preconsume(&token, 5_000).await.unwrap();
        assert_eq!(recorded, 5_000);
        assert_eq!(store.token(1).await.unwrap().unwrap().remaining_quota, 5_000);

        // actual usage is much smaller: delta is negative, token refunded
        let mut t = ticket(recorded);
        t.model_ratio = 1.0;
        let quota = ledger.settle(&t, 100, 100).await.unwrap();
        assert_eq!(quota, 200);
        assert_eq!(
            store.token(1).await.unwrap().unwrap().remaining_quota,
            10_000 - 200
        );
        let user = store.user(1).await.unwrap().unwrap();
        assert_eq!(user.used_quota, 200);
        assert_eq!(user.quota, 100_000 - 200);
        let logs = store.consume_logs().await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].content.contains("model ratio 1.0000"));
    }

    #[tokio::test]
    async fn failed_call_refund_restores_balance() {
        let (ledger, store) = seeded().await;
        let token = store.token(1).await.unwrap().unwrap();
        let recorded = ledger.preconsume(&token, 5_000).await.unwrap();
        assert_eq!(store.token(1).await.unwrap().unwrap().remaining_quota, 5_000);

        ledger.refund_detached(1, 1, recorded);
        // detached refund; poll until applied
        for _ in 0..50 {
            if store.token(1).await.unwrap().unwrap().remaining_quota == 10_000 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refund did not land");
    }

    #[tokio::test]
    async fn zero_token_failure_settles_zero() {
        let (ledger, store) = seeded().await;
        let quota = ledger.settle(&ticket(0), 0, 0).await.unwrap();
        assert_eq!(quota, 0);
        assert_eq!(store.user(1).await.unwrap().unwrap().used_quota, 0);
    }

    #[tokio::test]
    async fn batched_channel_updates_flush() {
        let store = MemStore::new();
        store
            .put_channel(crate::model::Channel {
                id: 7,
                name: "c".into(),
                kind: crate::model::ProviderKind::OpenAi,
                key: "k".into(),
                base_url: None,
                status: crate::model::ChannelStatus::Enabled,
                weight: 1,
                priority: 0,
                async_fanout: 1,
                model_mapping: Default::default(),
                models: vec![],
                groups: vec![],
                api_version: None,
                used_quota: 0,
            })
            .await;
        let ledger = QuotaLedger::new(Arc::new(store.clone()), None, 500, true);
        ledger.add_channel_quota(7, 10).await.unwrap();
        ledger.add_channel_quota(7, 5).await.unwrap();
        assert_eq!(store.channel(7).await.unwrap().unwrap().used_quota, 0);
        ledger.flush_batch().await;
        assert_eq!(store.channel(7).await.unwrap().unwrap().used_quota, 15);
    }
}
