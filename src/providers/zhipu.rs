//! Zhipu (ChatGLM) adapter. The credential is `id.secret`; authorization is
//! a short-lived HS256 JWT computed locally and cached. The upstream only
//! reports `total_tokens`, which is deliberately recorded as prompt tokens
//! with zero completion tokens; billing fixtures depend on that shape.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use http::header::{HeaderValue, AUTHORIZATION};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::error::{ErrorBody, RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::{response_lines, AdaptedRequest, ChannelContext};

const TOKEN_LIFETIME: Duration = Duration::from_secs(5 * 60);

static JWT_CACHE: Lazy<RwLock<HashMap<String, (String, Instant)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

#[derive(Debug, Serialize)]
struct ZhipuRequest {
    prompt: Vec<ZhipuMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ZhipuMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ZhipuResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ZhipuData>,
}

#[derive(Debug, Deserialize)]
struct ZhipuData {
    #[serde(default)]
    choices: Vec<ZhipuMessage>,
    #[serde(default)]
    usage: Option<ZhipuUsage>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct ZhipuUsage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ZhipuMeta {
    #[serde(default)]
    usage: Option<ZhipuUsage>,
}

/// Zhipu reports only a total; the canonical usage records it as prompt
/// tokens so downstream consumers see a stable, if lopsided, breakdown.
fn usage_from_total(total_tokens: u32) -> Usage {
    Usage {
        prompt_tokens: total_tokens,
        completion_tokens: 0,
        total_tokens,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// HS256 JWT with Zhipu's `sign_type: SIGN` header, built from the raw
/// crypto primitives and cached until shortly before expiry.
pub async fn jwt_for(key: &str) -> Result<String> {
    if let Some((token, expires)) = JWT_CACHE.read().await.get(key) {
        if *expires > Instant::now() {
            return Ok(token.clone());
        }
    }

    let (id, secret) = key.split_once('.').ok_or_else(|| RelayError::AuthConfig {
        provider: "zhipu",
        message: "credential must look like id.secret".to_string(),
    })?;

    let now_ms = unix_millis();
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","sign_type":"SIGN"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({
            "api_key": id,
            "exp": now_ms + TOKEN_LIFETIME.as_millis() as u64,
            "timestamp": now_ms,
        })
        .to_string(),
    );
    let signing_input = format!("{header}.{payload}");

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| RelayError::AuthConfig {
            provider: "zhipu",
            message: "secret is not usable as an hmac key".to_string(),
        })?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    let token = format!("{signing_input}.{signature}");

    JWT_CACHE.write().await.insert(
        key.to_string(),
        (token.clone(), Instant::now() + TOKEN_LIFETIME - Duration::from_secs(30)),
    );
    Ok(token)
}

pub async fn build_request(
    ctx: &ChannelContext,
    req: &GeneralRequest,
    outbound_model: &str,
) -> Result<AdaptedRequest> {
    let prompt = req
        .messages
        .iter()
        .map(|m| ZhipuMessage {
            role: if m.role == "assistant" {
                "assistant".to_string()
            } else {
                "user".to_string()
            },
            content: m.content.clone(),
        })
        .collect();
    let body = serde_json::to_vec(&ZhipuRequest {
        prompt,
        temperature: req.temperature,
        top_p: req.top_p,
    })
    .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;

    let task = if req.stream { "sse-invoke" } else { "invoke" };
    let url = ctx.full_url.clone().unwrap_or_else(|| {
        format!(
            "{}/api/paas/v3/model-api/{outbound_model}/{task}",
            ctx.base_url.trim_end_matches('/')
        )
    });

    let mut adapted = AdaptedRequest::json(url, body.into());
    let token = jwt_for(&ctx.key).await?;
    adapted
        .headers
        .insert(AUTHORIZATION, HeaderValue::from_str(&token).map_err(|_| {
            RelayError::AuthConfig {
                provider: "zhipu",
                message: "computed token is not a valid header value".to_string(),
            }
        })?);
    Ok(adapted)
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    model: &str,
) -> Result<(bytes::Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    let zhipu: ZhipuResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    if !zhipu.success {
        return Err(RelayError::Upstream {
            status: 500,
            error: ErrorBody {
                message: zhipu.msg,
                kind: "zhipu_error".to_string(),
                param: None,
                code: serde_json::json!(zhipu.code),
            },
        });
    }
    let data = zhipu.data.unwrap_or(ZhipuData {
        choices: Vec::new(),
        usage: None,
    });
    let content = data
        .choices
        .first()
        .map(|c| c.content.trim_matches('"').to_string())
        .unwrap_or_default();
    let usage = usage_from_total(data.usage.unwrap_or_default().total_tokens);
    let canonical = ChatResponse::assistant_text(model, content, usage);
    let body = serde_json::to_vec(&canonical)
        .map_err(|e| RelayError::internal("marshal_response_failed", e.to_string()))?;
    Ok((body.into(), usage))
}

/// Zhipu's SSE interleaves `data:` content lines with a terminal `meta:`
/// line carrying the usage.
pub async fn relay_stream(
    resp: reqwest::Response,
    sink: StreamSink,
    model: &str,
) -> Result<Usage> {
    let mut lines = Box::pin(response_lines(resp));
    let mut usage = Usage::default();

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let trimmed = line.trim();
        if let Some(meta) = trimmed.strip_prefix("meta:") {
            if let Ok(meta) = serde_json::from_str::<ZhipuMeta>(meta.trim()) {
                usage = usage_from_total(meta.usage.unwrap_or_default().total_tokens);
            }
            let chunk = StreamChunk::finish(model, "stop");
            sink.send_json(&chunk).await;
            break;
        }
        if let Some(token) = trimmed.strip_prefix("data:") {
            let token = token.trim_start();
            if token.is_empty() {
                continue;
            }
            let chunk = StreamChunk::content(model, token);
            if !sink.send_json(&chunk).await {
                break;
            }
        }
    }
    Ok(usage)
}

pub fn parse_error(bytes: &[u8]) -> Option<ErrorBody> {
    #[derive(Deserialize)]
    struct Envelope {
        code: i64,
        #[serde(default)]
        msg: String,
    }
    serde_json::from_slice::<Envelope>(bytes).ok().map(|e| ErrorBody {
        message: e.msg,
        kind: "zhipu_error".to_string(),
        param: None,
        code: serde_json::json!(e.code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jwt_has_three_segments_and_caches() {
        let token = jwt_for("my-id.my-secret").await.unwrap();
        assert_eq!(token.split('.').count(), 3);
        let header_json = URL_SAFE_NO_PAD
            .decode(token.split('.').next().unwrap())
            .unwrap();
        let header: serde_json::Value = serde_json::from_slice(&header_json).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["sign_type"], "SIGN");

        let again = jwt_for("my-id.my-secret").await.unwrap();
        assert_eq!(token, again);
    }

    #[tokio::test]
    async fn malformed_credential_is_config_error() {
        let err = jwt_for("no-dot-here").await.unwrap_err();
        assert!(matches!(err, RelayError::AuthConfig { provider: "zhipu", .. }));
    }

    #[test]
    fn usage_fallback_shape() {
        let usage = usage_from_total(42);
        assert_eq!(usage.prompt_tokens, 42);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 42);
    }

    #[tokio::test]
    async fn stream_task_suffix() {
        let ctx = ChannelContext {
            channel_id: 1,
            kind: crate::model::ProviderKind::Zhipu,
            key: "id.secret".into(),
            base_url: "https://open.bigmodel.cn".into(),
            full_url: None,
            library_id: None,
            api_version: None,
        };
        let mut req = GeneralRequest {
            model: "chatglm_pro".into(),
            ..Default::default()
        };
        let adapted = build_request(&ctx, &req, "chatglm_pro").await.unwrap();
        assert!(adapted.url.ends_with("/model-api/chatglm_pro/invoke"));

        req.stream = true;
        let adapted = build_request(&ctx, &req, "chatglm_pro").await.unwrap();
        assert!(adapted.url.ends_with("/model-api/chatglm_pro/sse-invoke"));
    }
}
