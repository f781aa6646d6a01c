//! Channel registry and group index. Materializes the `(group, model) →
//! channels` ability rows, answers weighted channel selection, and keeps a
//! TTL-bounded snapshot refreshed under a shared-KV lock so a fleet of nodes
//! does not stampede the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::kv::SharedKv;
use crate::model::{Channel, ChannelId};
use crate::store::Store;

const CACHE_TTL: Duration = Duration::from_secs(150);
const REFRESH_LOCK_KEY: &str = "channel_cache_lock";
const REFRESH_LOCK_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Snapshot {
    channels: HashMap<ChannelId, Channel>,
    abilities: HashMap<(String, String), Vec<ChannelId>>,
    loaded_at: Option<Instant>,
}

impl Snapshot {
    fn rebuild(channels: Vec<Channel>) -> Self {
        let mut abilities: HashMap<(String, String), Vec<ChannelId>> = HashMap::new();
        let mut by_id = HashMap::new();
        for channel in channels {
            if channel.is_enabled() {
                for group in &channel.groups {
                    for model in &channel.models {
                        abilities
                            .entry((group.clone(), model.clone()))
                            .or_default()
                            .push(channel.id);
                    }
                }
            }
            by_id.insert(channel.id, channel);
        }
        Self {
            channels: by_id,
            abilities,
            loaded_at: Some(Instant::now()),
        }
    }

    fn stale(&self) -> bool {
        match self.loaded_at {
            Some(at) => at.elapsed() > CACHE_TTL,
            None => true,
        }
    }
}

pub struct ChannelRegistry {
    store: Arc<dyn Store>,
    kv: Option<SharedKv>,
    snapshot: RwLock<Snapshot>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn Store>, kv: Option<SharedKv>) -> Self {
        Self {
            store,
            kv,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Rebuilds the ability index from the store. Called at warm-up and on
    /// every `channels_sync` notification.
    pub async fn reload(&self) -> Result<()> {
        let channels = self.store.channels().await?;
        let count = channels.len();
        *self.snapshot.write().await = Snapshot::rebuild(channels);
        debug!(channels = count, "channel group index rebuilt");
        Ok(())
    }

    pub async fn channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        if let Some(ch) = self.snapshot.read().await.channels.get(&id) {
            return Ok(Some(ch.clone()));
        }
        self.store.channel(id).await
    }

    /// Picks an enabled channel for `(group, model)`: highest priority tier
    /// only, weighted random inside the tier.
    pub async fn choose(&self, group: &str, model: &str) -> Result<Channel> {
        self.ensure_fresh().await;

        let snapshot = self.snapshot.read().await;
        let key = (group.to_string(), model.to_string());
        let candidates: Vec<&Channel> = snapshot
            .abilities
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| snapshot.channels.get(id))
                    .filter(|c| c.is_enabled())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(choice) = pick_weighted(&candidates) {
            return Ok(choice.clone());
        }
        drop(snapshot);
        // stale-cache miss: ask the store directly before giving up
        self.choose_direct(group, model).await
    }

    async fn choose_direct(&self, group: &str, model: &str) -> Result<Channel> {
        let channels = self.store.channels().await?;
        let candidates: Vec<&Channel> = channels
            .iter()
            .filter(|c| c.is_enabled() && c.supports(group, model))
            .collect();
        pick_weighted(&candidates)
            .map(|c| (*c).clone())
            .ok_or_else(|| RelayError::NoChannel {
                group: group.to_string(),
                model: model.to_string(),
            })
    }

    /// Refreshes the snapshot when past its TTL. The refresh runs under a
    /// short shared-KV lock; a node that loses the lock keeps serving the
    /// stale snapshot (and `choose` falls through to the store on miss).
    async fn ensure_fresh(&self) {
        if !self.snapshot.read().await.stale() {
            return;
        }
        if let Some(kv) = &self.kv {
            match kv
                .set_nx_px(REFRESH_LOCK_KEY, "1", REFRESH_LOCK_WINDOW)
                .await
            {
                Ok(true) => {
                    if let Err(e) = self.reload().await {
                        warn!(error = %e, "channel cache refresh failed");
                    }
                    if let Err(e) = kv.del(REFRESH_LOCK_KEY).await {
                        warn!(error = %e, "channel cache lock release failed");
                    }
                }
                Ok(false) => {
                    // a peer is refreshing; stale snapshot is acceptable
                }
                Err(e) => {
                    warn!(error = %e, "channel cache lock failed, reloading directly");
                    if let Err(e) = self.reload().await {
                        warn!(error = %e, "channel cache refresh failed");
                    }
                }
            }
        } else if let Err(e) = self.reload().await {
            warn!(error = %e, "channel cache refresh failed");
        }
    }
}

/// Weighted pick among the highest-priority tier. Zero total weight
/// degenerates to a uniform pick; an empty candidate set picks nothing.
fn pick_weighted<'a>(candidates: &[&'a Channel]) -> Option<&'a Channel> {
    let top = candidates.iter().map(|c| c.priority).max()?;
    let tier: Vec<&Channel> = candidates
        .iter()
        .copied()
        .filter(|c| c.priority == top)
        .collect();

    let total: u64 = tier.iter().map(|c| u64::from(c.weight)).sum();
    let mut rng = rand::thread_rng();
    if total == 0 {
        return tier.get(rng.gen_range(0..tier.len())).copied();
    }
    let mut roll = rng.gen_range(0..total);
    for channel in tier.iter().copied() {
        let weight = u64::from(channel.weight);
        if roll < weight {
            return Some(channel);
        }
        roll -= weight;
    }
    tier.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelStatus, ProviderKind};
    use crate::store::MemStore;

    fn channel(id: ChannelId, priority: i32, weight: u32) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            kind: ProviderKind::OpenAi,
            key: "k".into(),
            base_url: None,
            status: ChannelStatus::Enabled,
            weight,
            priority,
            async_fanout: 1,
            model_mapping: HashMap::new(),
            models: vec!["gpt-3.5-turbo".into()],
            groups: vec!["default".into()],
            api_version: None,
            used_quota: 0,
        }
    }

    async fn registry_with(channels: Vec<Channel>) -> ChannelRegistry {
        let store = MemStore::new();
        for ch in channels {
            store.put_channel(ch).await;
        }
        let registry = ChannelRegistry::new(Arc::new(store), None);
        registry.reload().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn chooses_only_highest_priority() {
        let registry =
            registry_with(vec![channel(1, 0, 1), channel(2, 10, 1), channel(3, 10, 1)]).await;
        for _ in 0..50 {
            let picked = registry.choose("default", "gpt-3.5-turbo").await.unwrap();
            assert_ne!(picked.id, 1, "lower priority channel must never win");
        }
    }

    #[tokio::test]
    async fn disabled_channels_are_invisible() {
        let mut dead = channel(1, 0, 100);
        dead.status = ChannelStatus::AutoDisabled;
        let registry = registry_with(vec![dead, channel(2, 0, 1)]).await;
        for _ in 0..20 {
            let picked = registry.choose("default", "gpt-3.5-turbo").await.unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[tokio::test]
    async fn no_match_is_an_error() {
        let registry = registry_with(vec![channel(1, 0, 1)]).await;
        let err = registry.choose("default", "no-such-model").await.unwrap_err();
        assert!(matches!(err, RelayError::NoChannel { .. }));
        let err = registry.choose("other-group", "gpt-3.5-turbo").await.unwrap_err();
        assert!(matches!(err, RelayError::NoChannel { .. }));
    }

    #[tokio::test]
    async fn weights_bias_the_pick() {
        let registry = registry_with(vec![channel(1, 0, 99), channel(2, 0, 1)]).await;
        let mut hits = [0u32; 2];
        for _ in 0..200 {
            let picked = registry.choose("default", "gpt-3.5-turbo").await.unwrap();
            hits[(picked.id - 1) as usize] += 1;
        }
        assert!(hits[0] > hits[1], "weight 99 should dominate weight 1");
    }

    #[tokio::test]
    async fn zero_weight_tier_still_picks() {
        let registry = registry_with(vec![channel(1, 0, 0), channel(2, 0, 0)]).await;
        let picked = registry.choose("default", "gpt-3.5-turbo").await.unwrap();
        assert!(picked.id == 1 || picked.id == 2);
    }

    #[tokio::test]
    async fn newly_inserted_channel_found_via_direct_read() {
        let store = MemStore::new();
        let registry = ChannelRegistry::new(Arc::new(store.clone()), None);
        registry.reload().await.unwrap();
        // inserted after the snapshot was built
        store.put_channel(channel(5, 0, 1)).await;
        let picked = registry.choose("default", "gpt-3.5-turbo").await.unwrap();
        assert_eq!(picked.id, 5);
    }
}
