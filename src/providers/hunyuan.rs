//! Tencent Hunyuan adapter. The credential is `appId|secretId|secretKey`;
//! each request is signed with HMAC-SHA1 over the sorted query form of the
//! body and the signature travels in `Authorization`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use http::header::{HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::error::{ErrorBody, RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::{response_lines, sse_data, AdaptedRequest, ChannelContext};

const SIGN_HOST: &str = "hunyuan.cloud.tencent.com";
const CHAT_PATH: &str = "/hyllm/v1/chat/completions";

struct Credential {
    app_id: i64,
    secret_id: String,
    secret_key: String,
}

fn parse_credential(key: &str) -> Result<Credential> {
    let parts: Vec<&str> = key.split('|').collect();
    let [app_id, secret_id, secret_key] = parts.as_slice() else {
        return Err(RelayError::AuthConfig {
            provider: "hunyuan",
            message: "credential must look like appId|secretId|secretKey".to_string(),
        });
    };
    let app_id = app_id.parse().map_err(|_| RelayError::AuthConfig {
        provider: "hunyuan",
        message: "appId must be numeric".to_string(),
    })?;
    Ok(Credential {
        app_id,
        secret_id: secret_id.to_string(),
        secret_key: secret_key.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct HunyuanMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct HunyuanRequest {
    app_id: i64,
    secret_id: String,
    timestamp: i64,
    expired: i64,
    query_id: String,
    messages: Vec<HunyuanMessage>,
    temperature: f64,
    top_p: f64,
    stream: i32,
}

#[derive(Debug, Deserialize, Default)]
struct HunyuanResponse {
    #[serde(default)]
    choices: Vec<HunyuanChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<HunyuanError>,
}

#[derive(Debug, Deserialize, Default)]
struct HunyuanChoice {
    #[serde(default)]
    finish_reason: String,
    #[serde(default)]
    messages: Option<HunyuanMessage>,
    #[serde(default)]
    delta: Option<HunyuanDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct HunyuanDelta {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct HunyuanError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Sign string: `host + path + "?"` followed by the sorted `k=v` pairs of
/// the request, HMAC-SHA1 under the secret key, base64.
fn sign(credential: &Credential, request: &HunyuanRequest) -> Result<String> {
    let messages_json = serde_json::to_string(&request.messages)
        .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;
    let mut params = BTreeMap::new();
    params.insert("app_id", request.app_id.to_string());
    params.insert("secret_id", request.secret_id.clone());
    params.insert("timestamp", request.timestamp.to_string());
    params.insert("expired", request.expired.to_string());
    params.insert("query_id", request.query_id.clone());
    params.insert("messages", messages_json);
    params.insert("temperature", format!("{}", request.temperature));
    params.insert("top_p", format!("{}", request.top_p));
    params.insert("stream", request.stream.to_string());

    let joined = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let sign_input = format!("{SIGN_HOST}{CHAT_PATH}?{joined}");

    let mut mac = Hmac::<Sha1>::new_from_slice(credential.secret_key.as_bytes()).map_err(|_| {
        RelayError::AuthConfig {
            provider: "hunyuan",
            message: "secretKey is not usable as an hmac key".to_string(),
        }
    })?;
    mac.update(sign_input.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn build_request(ctx: &ChannelContext, req: &GeneralRequest) -> Result<AdaptedRequest> {
    let credential = parse_credential(&ctx.key)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let messages = req
        .messages
        .iter()
        .map(|m| HunyuanMessage {
            role: if m.role == "assistant" {
                "assistant".to_string()
            } else {
                "user".to_string()
            },
            content: m.content.clone(),
        })
        .collect();

    let native = HunyuanRequest {
        app_id: credential.app_id,
        secret_id: credential.secret_id.clone(),
        timestamp: now,
        expired: now + 24 * 60 * 60,
        query_id: uuid::Uuid::new_v4().to_string(),
        messages,
        temperature: req.temperature.map(f64::from).unwrap_or(1.0),
        top_p: req.top_p.map(f64::from).unwrap_or(1.0),
        stream: i32::from(req.stream),
    };
    let signature = sign(&credential, &native)?;
    let body = serde_json::to_vec(&native)
        .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;

    let url = ctx
        .full_url
        .clone()
        .unwrap_or_else(|| format!("{}{CHAT_PATH}", ctx.base_url.trim_end_matches('/')));
    let mut adapted = AdaptedRequest::json(url, body.into());
    adapted.headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&signature).map_err(|_| RelayError::AuthConfig {
            provider: "hunyuan",
            message: "computed signature is not a valid header value".to_string(),
        })?,
    );
    Ok(adapted)
}

fn check_error(resp: &HunyuanResponse) -> Result<()> {
    match &resp.error {
        Some(error) if error.code != 0 => Err(RelayError::Upstream {
            status: 500,
            error: ErrorBody {
                message: error.message.clone(),
                kind: "hunyuan_error".to_string(),
                param: None,
                code: serde_json::json!(error.code),
            },
        }),
        _ => Ok(()),
    }
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    model: &str,
) -> Result<(bytes::Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    let parsed: HunyuanResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    check_error(&parsed)?;
    let usage = parsed.usage.unwrap_or_default();
    let content = parsed
        .choices
        .first()
        .and_then(|c| c.messages.as_ref())
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let canonical = ChatResponse::assistant_text(model, content, usage);
    let body = serde_json::to_vec(&canonical)
        .map_err(|e| RelayError::internal("marshal_response_failed", e.to_string()))?;
    Ok((body.into(), usage))
}

pub async fn relay_stream(
    resp: reqwest::Response,
    sink: StreamSink,
    model: &str,
    prompt_tokens: u32,
) -> Result<Usage> {
    let mut lines = Box::pin(response_lines(resp));
    let mut collected = String::new();
    let mut usage: Option<Usage> = None;

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<HunyuanResponse>(payload) else {
            continue;
        };
        check_error(&event)?;
        if let Some(u) = event.usage {
            if u.total_tokens > 0 {
                usage = Some(u);
            }
        }
        let Some(choice) = event.choices.first() else {
            continue;
        };
        let delta = choice
            .delta
            .as_ref()
            .map(|d| d.content.clone())
            .unwrap_or_default();
        collected.push_str(&delta);

        let finished = !choice.finish_reason.is_empty();
        let mut chunk = StreamChunk::content(model, delta);
        if finished {
            chunk.choices[0].finish_reason = Some(choice.finish_reason.clone());
        }
        if !sink.send_json(&chunk).await {
            break;
        }
        if finished {
            break;
        }
    }

    Ok(usage.unwrap_or_else(|| {
        Usage::new(prompt_tokens, crate::counter::count_text(&collected, model))
    }))
}

pub fn parse_error(bytes: &[u8]) -> Option<ErrorBody> {
    #[derive(Deserialize)]
    struct Envelope {
        error: HunyuanError,
    }
    serde_json::from_slice::<Envelope>(bytes).ok().map(|e| ErrorBody {
        message: e.error.message,
        kind: "hunyuan_error".to_string(),
        param: None,
        code: serde_json::json!(e.error.code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChatMessage;

    #[test]
    fn credential_parsing() {
        let cred = parse_credential("1234|sid|skey").unwrap();
        assert_eq!(cred.app_id, 1234);
        assert_eq!(cred.secret_id, "sid");
        assert!(parse_credential("only-two|parts").is_err());
        assert!(parse_credential("nan|sid|skey").is_err());
    }

    #[test]
    fn signature_is_deterministic_for_fixed_request() {
        let credential = parse_credential("1|sid|skey").unwrap();
        let request = HunyuanRequest {
            app_id: 1,
            secret_id: "sid".into(),
            timestamp: 1000,
            expired: 87400,
            query_id: "q".into(),
            messages: vec![HunyuanMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            temperature: 1.0,
            top_p: 1.0,
            stream: 0,
        };
        let a = sign(&credential, &request).unwrap();
        let b = sign(&credential, &request).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn request_carries_app_and_secret_ids() {
        let ctx = ChannelContext {
            channel_id: 1,
            kind: crate::model::ProviderKind::TencentHunyuan,
            key: "42|sid|skey".into(),
            base_url: "https://hunyuan.cloud.tencent.com".into(),
            full_url: None,
            library_id: None,
            api_version: None,
        };
        let req = GeneralRequest {
            model: "ChatPro".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            ..Default::default()
        };
        let adapted = build_request(&ctx, &req).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&adapted.body).unwrap();
        assert_eq!(body["app_id"], 42);
        assert_eq!(body["secret_id"], "sid");
        assert!(adapted.headers.get(AUTHORIZATION).is_some());
        assert!(adapted.url.ends_with(CHAT_PATH));
    }
}
