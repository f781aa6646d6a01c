//! Realtime configuration sync. Every node subscribes to two pub/sub
//! topics; a node that mutates configuration publishes a message tagged
//! with its own instance id so peers reload and it does not. Reload
//! handlers run in their own task so a panicking reload cannot take the
//! subscriber loop down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tracing::{error, info, warn};

use crate::kv::SharedKv;
use crate::model::ProviderKind;
use crate::AppState;

pub const OPTIONS_TOPIC: &str = "options_sync";
pub const CHANNELS_TOPIC: &str = "channels_sync";

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// `{origin_instance_id}|{free_text}`.
pub fn encode(origin: &str, text: &str) -> String {
    format!("{origin}|{text}")
}

pub fn split_origin(payload: &str) -> Option<(&str, &str)> {
    payload.split_once('|')
}

/// Announces a channel mutation to peers.
pub async fn publish_channel_update(kv: &SharedKv, instance_id: &str) {
    if let Err(e) = kv
        .publish(CHANNELS_TOPIC, &encode(instance_id, "reload"))
        .await
    {
        warn!(error = %e, "channel update publish failed");
    }
}

pub fn spawn(state: Arc<AppState>) {
    let Some(kv) = state.kv.clone() else {
        return;
    };
    tokio::spawn(run(state, kv));
}

async fn run(state: Arc<AppState>, kv: SharedKv) {
    // stagger the warm load so a fleet restart does not hit the store at once
    let stagger = rand::thread_rng().gen_range(0..500);
    tokio::time::sleep(Duration::from_millis(stagger)).await;
    reload_channels(&state).await;
    reload_options(&state).await;

    loop {
        if let Err(e) = subscribe(&state, &kv).await {
            warn!(error = %e, "pub/sub subscription dropped, reconnecting");
        }
        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
    }
}

async fn subscribe(state: &Arc<AppState>, kv: &SharedKv) -> Result<(), redis::RedisError> {
    let conn = kv.client().get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(OPTIONS_TOPIC).await?;
    pubsub.subscribe(CHANNELS_TOPIC).await?;
    info!("subscribed to {OPTIONS_TOPIC} and {CHANNELS_TOPIC}");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let topic = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, topic, "undecodable pub/sub payload");
                continue;
            }
        };
        handle_message(state, &topic, &payload).await;
    }
    Ok(())
}

async fn handle_message(state: &Arc<AppState>, topic: &str, payload: &str) {
    let Some((origin, _)) = split_origin(payload) else {
        warn!(topic, payload, "pub/sub payload without origin tag");
        return;
    };
    if origin == state.cfg.instance_id {
        // self-origin suppression: this node caused the change
        return;
    }

    let state = Arc::clone(state);
    let topic = topic.to_string();
    // reloads run in their own task: a panic is contained and logged here
    let reload = tokio::spawn(async move {
        match topic.as_str() {
            OPTIONS_TOPIC => reload_options(&state).await,
            CHANNELS_TOPIC => {
                reload_channels(&state).await;
                // derived tables follow the channel set
                reload_options(&state).await;
            }
            _ => {}
        }
    });
    if let Err(e) = reload.await {
        if e.is_panic() {
            error!(error = %e, "configuration reload panicked");
        }
    }
}

async fn reload_options(state: &Arc<AppState>) {
    match state.store.options().await {
        Ok(options) => {
            state.pricing.reload_from_options(&options).await;
            info!(options = options.len(), "options reloaded");
        }
        Err(e) => warn!(error = %e, "options reload failed"),
    }
}

async fn reload_channels(state: &Arc<AppState>) {
    if let Err(e) = state.registry.reload().await {
        warn!(error = %e, "channel index reload failed");
        return;
    }
    // keep the model-owner table consistent with the channel set
    match state.store.channels().await {
        Ok(channels) => {
            let mut owners: HashMap<String, String> = HashMap::new();
            for channel in channels {
                let owner = owner_of(channel.kind);
                for model in &channel.models {
                    owners.entry(model.clone()).or_insert_with(|| owner.to_string());
                }
            }
            state.pricing.replace_model_owners(owners).await;
        }
        Err(e) => warn!(error = %e, "model owner rebuild failed"),
    }
}

fn owner_of(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi | ProviderKind::Azure | ProviderKind::OpenAiWeb => "OpenAI",
        ProviderKind::AnthropicClaude => "Anthropic",
        ProviderKind::GooglePalm => "Google",
        ProviderKind::BaiduErnie => "Baidu",
        ProviderKind::Zhipu => "Zhipu",
        ProviderKind::AlibabaDashScope => "Alibaba",
        ProviderKind::XunfeiSpark => "Xunfei",
        ProviderKind::AiProxyLibrary => "AIProxy",
        ProviderKind::TencentHunyuan => "Tencent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use crate::config::AppConfig;
    use crate::ledger::QuotaLedger;
    use crate::model::{Channel, ChannelStatus};
    use crate::pricing::Pricing;
    use crate::registry::ChannelRegistry;
    use crate::relay::dispatch::RacingClient;
    use crate::store::MemStore;

    #[test]
    fn payload_encoding_round_trips() {
        let payload = encode("node-1-abc", "reload");
        assert_eq!(split_origin(&payload), Some(("node-1-abc", "reload")));
        assert_eq!(split_origin("no-separator"), None);
    }

    #[test]
    fn origin_with_pipes_in_text_keeps_first_split() {
        let payload = encode("origin", "a|b|c");
        assert_eq!(split_origin(&payload), Some(("origin", "a|b|c")));
    }

    fn test_state(store: MemStore) -> Arc<AppState> {
        let cfg = AppConfig {
            listen_addr: "127.0.0.1:0".into(),
            relay_timeout_secs: 0,
            relay_response_timeout_secs: 5,
            redis_url: None,
            leader_election_enable: false,
            leader_lease_seconds: 15,
            is_master_node: true,
            pre_consumed_quota: 500,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            instance_id: "node-self".into(),
            channel_base_urls: Default::default(),
            rps: 20,
            burst: 40,
            max_concurrency: None,
            otlp_endpoint: None,
            service_name: "relay-gateway".into(),
        };
        let store: Arc<dyn crate::store::Store> = Arc::new(store);
        Arc::new(AppState {
            ledger: Arc::new(QuotaLedger::new(store.clone(), None, 500, false)),
            registry: Arc::new(ChannelRegistry::new(store.clone(), None)),
            pricing: Arc::new(Pricing::new()),
            racing: Arc::new(
                RacingClient::new(Duration::from_secs(5), None).expect("client builds"),
            ),
            is_master: Arc::new(AtomicBool::new(true)),
            kv: None,
            store,
            cfg: Arc::new(cfg),
        })
    }

    #[tokio::test]
    async fn self_origin_messages_never_trigger_reload() {
        let store = MemStore::new();
        let state = test_state(store.clone());
        store
            .put_channel(Channel {
                id: 1,
                name: "zhipu".into(),
                kind: ProviderKind::Zhipu,
                key: "id.secret".into(),
                base_url: None,
                status: ChannelStatus::Enabled,
                weight: 1,
                priority: 0,
                async_fanout: 1,
                model_mapping: Default::default(),
                models: vec!["test-model".into()],
                groups: vec!["default".into()],
                api_version: None,
                used_quota: 0,
            })
            .await;

        handle_message(&state, CHANNELS_TOPIC, &encode("node-self", "reload")).await;
        assert_eq!(state.pricing.owner_of("test-model").await, None);

        handle_message(&state, CHANNELS_TOPIC, &encode("node-other", "reload")).await;
        assert_eq!(
            state.pricing.owner_of("test-model").await,
            Some("Zhipu".to_string())
        );
    }
}
