use std::{collections::HashMap, sync::Arc, time::Duration};

use governor::middleware::NoOpMiddleware;
use http::Request;
use serde::Deserialize;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};

use crate::model::ProviderKind;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,

    // relay HTTP clients
    /// Global client timeout in seconds; 0 means unlimited.
    #[serde(default)]
    pub relay_timeout_secs: u64,
    /// Time allowed for upstream response headers in the racing client.
    /// Floored at 5 seconds.
    #[serde(default = "default_response_timeout")]
    pub relay_response_timeout_secs: u64,

    // shared KV
    #[serde(default)]
    pub redis_url: Option<String>,

    // leader election
    #[serde(default = "default_true")]
    pub leader_election_enable: bool,
    #[serde(default = "default_lease_seconds")]
    pub leader_lease_seconds: u64,
    /// Static role used when election is disabled or redis is absent.
    #[serde(default = "default_true")]
    pub is_master_node: bool,

    // quota
    #[serde(default = "default_preconsumed_quota")]
    pub pre_consumed_quota: i64,
    #[serde(default)]
    pub batch_update_enabled: bool,
    #[serde(default = "default_batch_interval")]
    pub batch_update_interval_secs: u64,

    /// Identity used for self-origin suppression on pub/sub topics.
    pub instance_id: String,

    /// Per-provider default base URLs; channel-level base URLs win.
    #[serde(default)]
    pub channel_base_urls: HashMap<String, String>,

    // rate limit
    #[serde(default = "default_rps")]
    pub rps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    // telemetry
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_rps() -> u32 {
    20
}
fn default_burst() -> u32 {
    40
}

fn default_response_timeout() -> u64 {
    5
}

fn default_lease_seconds() -> u64 {
    15
}

fn default_preconsumed_quota() -> i64 {
    500
}

fn default_batch_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "relay-gateway".to_string()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr =
            std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let relay_timeout_secs = env_parse("RELAY_TIMEOUT", 0);
        let relay_response_timeout_secs =
            env_parse("RELAY_RESPONSE_TIMEOUT", default_response_timeout()).max(5);
        let redis_url = std::env::var("REDIS_URL").ok();
        let leader_election_enable = env_parse("LEADER_ELECTION_ENABLE", true);
        let leader_lease_seconds =
            env_parse("LEADER_LEASE_SECONDS", default_lease_seconds()).max(2);
        let is_master_node = env_parse("IS_MASTER_NODE", true);
        let pre_consumed_quota = env_parse("PRE_CONSUMED_QUOTA", default_preconsumed_quota());
        let batch_update_enabled = env_parse("BATCH_UPDATE_ENABLED", false);
        let batch_update_interval_secs =
            env_parse("BATCH_UPDATE_INTERVAL_SECS", default_batch_interval()).max(1);
        let instance_id = std::env::var("INSTANCE_ID").unwrap_or_else(|_| {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "node".to_string());
            format!("{host}-{}", uuid::Uuid::new_v4())
        });
        let channel_base_urls = channel_base_urls_from_env();
        let rps = env_parse("RPS", default_rps());
        let burst = env_parse("BURST", default_burst());
        let max_concurrency = std::env::var("MAX_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok());
        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name());

        Ok(Self {
            listen_addr,
            relay_timeout_secs,
            relay_response_timeout_secs,
            redis_url,
            leader_election_enable,
            leader_lease_seconds,
            is_master_node,
            pre_consumed_quota,
            batch_update_enabled,
            batch_update_interval_secs,
            instance_id,
            channel_base_urls,
            rps,
            burst,
            max_concurrency,
            otlp_endpoint,
            service_name,
        })
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_response_timeout_secs.max(5))
    }

    pub fn relay_timeout(&self) -> Option<Duration> {
        (self.relay_timeout_secs > 0).then(|| Duration::from_secs(self.relay_timeout_secs))
    }

    pub fn base_url_for(&self, kind: ProviderKind) -> String {
        self.channel_base_urls
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| kind.default_base_url().to_string())
    }

    pub fn build_governor(&self) -> anyhow::Result<GovernorLayer<BearerExtractor, NoOpMiddleware>> {
        if self.rps == 0 {
            anyhow::bail!("RPS must be greater than zero");
        }
        if self.burst == 0 {
            anyhow::bail!("BURST must be greater than zero");
        }

        let mut builder = GovernorConfigBuilder::default();
        let mut builder = builder.key_extractor(BearerExtractor);
        builder.period(Duration::from_secs(1) / self.rps);
        builder.burst_size(self.burst);

        let config = builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid governor configuration"))?;

        Ok(GovernorLayer {
            config: Arc::new(config),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// CHANNEL_BASE_URL_OPENAI, CHANNEL_BASE_URL_CLAUDE, ... override the
/// built-in provider defaults.
fn channel_base_urls_from_env() -> HashMap<String, String> {
    const KINDS: &[ProviderKind] = &[
        ProviderKind::OpenAi,
        ProviderKind::Azure,
        ProviderKind::AnthropicClaude,
        ProviderKind::GooglePalm,
        ProviderKind::BaiduErnie,
        ProviderKind::Zhipu,
        ProviderKind::AlibabaDashScope,
        ProviderKind::XunfeiSpark,
        ProviderKind::AiProxyLibrary,
        ProviderKind::TencentHunyuan,
        ProviderKind::OpenAiWeb,
    ];
    let mut urls = HashMap::new();
    for kind in KINDS {
        let var = format!("CHANNEL_BASE_URL_{}", kind.as_str().to_uppercase());
        if let Ok(url) = std::env::var(&var) {
            if !url.is_empty() {
                urls.insert(kind.as_str().to_string(), url);
            }
        }
    }
    urls
}

#[derive(Clone, Copy)]
pub struct BearerExtractor;

impl KeyExtractor for BearerExtractor {
    type Key = String;

    fn extract<B>(&self, req: &Request<B>) -> Result<Self::Key, GovernorError> {
        // Rate-limit per caller token when present, else per client IP+path
        if let Some(auth) = req.headers().get(http::header::AUTHORIZATION) {
            if let Ok(s) = auth.to_str() {
                let token = s.trim_start_matches("Bearer ").trim();
                if !token.is_empty() {
                    return Ok(format!("key:{token}"));
                }
            }
        }
        let ip = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        let path = req.uri().path();
        Ok(format!("ip:{ip}:{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            listen_addr: "127.0.0.1:0".into(),
            relay_timeout_secs: 0,
            relay_response_timeout_secs: 1,
            redis_url: None,
            leader_election_enable: true,
            leader_lease_seconds: 15,
            is_master_node: true,
            pre_consumed_quota: 500,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            instance_id: "node-test".into(),
            channel_base_urls: HashMap::new(),
            rps: 20,
            burst: 40,
            max_concurrency: None,
            otlp_endpoint: None,
            service_name: "relay-gateway".into(),
        }
    }

    #[test]
    fn response_timeout_floored_at_five_seconds() {
        let cfg = base_config();
        assert_eq!(cfg.response_header_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.relay_timeout(), None);
    }

    #[test]
    fn base_url_defaults_per_kind() {
        let mut cfg = base_config();
        assert_eq!(
            cfg.base_url_for(ProviderKind::AnthropicClaude),
            "https://api.anthropic.com"
        );
        cfg.channel_base_urls
            .insert("claude".into(), "https://claude.example".into());
        assert_eq!(
            cfg.base_url_for(ProviderKind::AnthropicClaude),
            "https://claude.example"
        );
    }
}
