//! Leader election over the shared KV: one lease key, set-if-absent to
//! acquire, a server-side compare-and-renew script to keep it. Exactly one
//! node observes itself as leader in steady state; background jobs gate on
//! that role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::kv::SharedKv;

const LEASE_KEY: &str = "leader";
const STEADY_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Renewal must be atomic on the server so a node that lost the lease can
/// never revive it.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end"#;

pub fn node_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4())
}

/// Starts the election loop, or pins the static role when election is
/// disabled (no KV, or explicitly turned off).
pub fn spawn(kv: Option<SharedKv>, cfg: &AppConfig, role: Arc<AtomicBool>) {
    let Some(kv) = kv else {
        role.store(cfg.is_master_node, Ordering::Relaxed);
        info!(
            is_master = cfg.is_master_node,
            "shared KV not configured, using static leader role"
        );
        return;
    };
    if !cfg.leader_election_enable {
        role.store(cfg.is_master_node, Ordering::Relaxed);
        info!(
            is_master = cfg.is_master_node,
            "leader election disabled, using static leader role"
        );
        return;
    }
    let lease = Duration::from_secs(cfg.leader_lease_seconds);
    tokio::spawn(run(kv, lease, node_identity(), role));
}

pub fn renew_interval(lease: Duration) -> Duration {
    (lease / 2).max(Duration::from_secs(1))
}

async fn run(kv: SharedKv, lease: Duration, node_id: String, role: Arc<AtomicBool>) {
    let script = redis::Script::new(RENEW_SCRIPT);
    let interval = renew_interval(lease);
    let lease_ms = lease.as_millis().to_string();
    let mut leader = false;
    let mut last_steady_log = Instant::now() - STEADY_LOG_INTERVAL;

    info!(node_id = %node_id, lease_secs = lease.as_secs(), "leader election started");
    loop {
        if leader {
            let renewed = kv
                .eval_i64(&script, &[LEASE_KEY], &[node_id.clone(), lease_ms.clone()])
                .await;
            match renewed {
                Ok(1) => {
                    if last_steady_log.elapsed() >= STEADY_LOG_INTERVAL {
                        info!(node_id = %node_id, "lease renewed, still leader");
                        last_steady_log = Instant::now();
                    }
                }
                Ok(_) => {
                    // somebody else holds the lease now
                    leader = false;
                    role.store(false, Ordering::Relaxed);
                    info!(node_id = %node_id, "lease lost, demoted to follower");
                }
                Err(e) => {
                    leader = false;
                    role.store(false, Ordering::Relaxed);
                    warn!(error = %e, "lease renewal failed, demoted to follower");
                }
            }
        } else {
            match kv.set_nx_px(LEASE_KEY, &node_id, lease).await {
                Ok(true) => {
                    leader = true;
                    role.store(true, Ordering::Relaxed);
                    info!(node_id = %node_id, "lease acquired, promoted to leader");
                    last_steady_log = Instant::now();
                }
                Ok(false) => {
                    if last_steady_log.elapsed() >= STEADY_LOG_INTERVAL {
                        info!(node_id = %node_id, "lease held elsewhere, still follower");
                        last_steady_log = Instant::now();
                    }
                }
                Err(e) => {
                    if last_steady_log.elapsed() >= STEADY_LOG_INTERVAL {
                        warn!(error = %e, "lease acquisition failed");
                        last_steady_log = Instant::now();
                    }
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_is_half_lease_floored() {
        assert_eq!(renew_interval(Duration::from_secs(15)), Duration::from_millis(7500));
        assert_eq!(renew_interval(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(renew_interval(Duration::from_millis(500)), Duration::from_secs(1));
    }

    #[test]
    fn node_identity_carries_host_and_uuid() {
        let a = node_identity();
        let b = node_identity();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[test]
    fn static_role_when_kv_absent() {
        let cfg = AppConfig {
            listen_addr: "127.0.0.1:0".into(),
            relay_timeout_secs: 0,
            relay_response_timeout_secs: 5,
            redis_url: None,
            leader_election_enable: true,
            leader_lease_seconds: 15,
            is_master_node: false,
            pre_consumed_quota: 500,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            instance_id: "node-test".into(),
            channel_base_urls: Default::default(),
            rps: 20,
            burst: 40,
            max_concurrency: None,
            otlp_endpoint: None,
            service_name: "relay-gateway".into(),
        };
        let role = Arc::new(AtomicBool::new(true));
        spawn(None, &cfg, role.clone());
        assert!(!role.load(Ordering::Relaxed));
    }
}
