//! Baidu ERNIE adapter. Each model maps to its own fixed endpoint, and the
//! channel credential (`api_key|secret_key`) is exchanged for a short-lived
//! access token appended as a query parameter. Tokens are cached per
//! credential until shortly before expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ErrorBody, RelayError, Result};
use crate::model::RelayMode;
use crate::relay::stream::StreamSink;
use crate::schema::{
    ChatResponse, EmbeddingResponse, GeneralRequest, StreamChunk, Usage,
};

use super::{response_lines, sse_data, AdaptedRequest, ChannelContext};

static ACCESS_TOKENS: Lazy<RwLock<HashMap<String, (String, Instant)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn endpoint_for(model: &str) -> &'static str {
    match model {
        "ERNIE-Bot" => "completions",
        "ERNIE-Bot-turbo" => "eb-instant",
        "ERNIE-Bot-4" => "completions_pro",
        "BLOOMZ-7B" => "bloomz_7b1",
        "Embedding-V1" => "embedding-v1",
        _ => "completions",
    }
}

#[derive(Debug, Serialize)]
struct ErnieChatRequest {
    messages: Vec<ErnieMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ErnieMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ErnieEmbeddingRequest {
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErnieChatResponse {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_end: bool,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct ErnieEmbeddingData {
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    index: u32,
}

#[derive(Debug, Deserialize)]
struct ErnieEmbeddingResponse {
    #[serde(default)]
    data: Vec<ErnieEmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Exchanges `api_key|secret_key` for an access token, with caching.
async fn access_token(key: &str, http: &reqwest::Client) -> Result<String> {
    if let Some((token, expires)) = ACCESS_TOKENS.read().await.get(key) {
        if *expires > Instant::now() {
            return Ok(token.clone());
        }
    }

    let (api_key, secret_key) = key.split_once('|').ok_or_else(|| RelayError::AuthConfig {
        provider: "ernie",
        message: "credential must look like api_key|secret_key".to_string(),
    })?;
    let url = format!(
        "https://aip.baidubce.com/oauth/2.0/token?grant_type=client_credentials&client_id={api_key}&client_secret={secret_key}"
    );
    let resp = http.post(&url).send().await?;
    if !resp.status().is_success() {
        return Err(RelayError::AuthConfig {
            provider: "ernie",
            message: format!("access token exchange failed with {}", resp.status()),
        });
    }
    let token: AccessTokenResponse = resp
        .json()
        .await
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;

    let ttl = Duration::from_secs(token.expires_in.saturating_sub(60).max(60));
    ACCESS_TOKENS.write().await.insert(
        key.to_string(),
        (token.access_token.clone(), Instant::now() + ttl),
    );
    Ok(token.access_token)
}

pub async fn build_request(
    ctx: &ChannelContext,
    req: &GeneralRequest,
    outbound_model: &str,
    http: &reqwest::Client,
) -> Result<AdaptedRequest> {
    let token = access_token(&ctx.key, http).await?;
    let base = ctx.base_url.trim_end_matches('/');
    let endpoint = endpoint_for(outbound_model);

    if outbound_model == "Embedding-V1" {
        let inputs = match req.input.as_ref() {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let body = serde_json::to_vec(&ErnieEmbeddingRequest { input: inputs })
            .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;
        let url = format!(
            "{base}/rpc/2.0/ai_custom/v1/wenxinworkshop/embeddings/{endpoint}?access_token={token}"
        );
        return Ok(AdaptedRequest::json(url, body.into()));
    }

    // ERNIE accepts only alternating user/assistant turns; system content is
    // folded into the first user message
    let mut messages = Vec::new();
    for message in &req.messages {
        match message.role.as_str() {
            "assistant" => messages.push(ErnieMessage {
                role: "assistant".to_string(),
                content: message.content.clone(),
            }),
            _ => messages.push(ErnieMessage {
                role: "user".to_string(),
                content: message.content.clone(),
            }),
        }
    }
    let body = serde_json::to_vec(&ErnieChatRequest {
        messages,
        stream: req.stream,
    })
    .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;
    let url = format!(
        "{base}/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{endpoint}?access_token={token}"
    );
    Ok(AdaptedRequest::json(url, body.into()))
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    mode: RelayMode,
    model: &str,
) -> Result<(bytes::Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    if mode == RelayMode::Embeddings {
        let ernie: ErnieEmbeddingResponse = serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
        if ernie.error_code != 0 {
            return Err(upstream_error(ernie.error_code, ernie.error_msg));
        }
        let usage = ernie.usage.unwrap_or_default();
        let canonical = EmbeddingResponse {
            object: "list".to_string(),
            data: ernie
                .data
                .into_iter()
                .map(|d| crate::schema::EmbeddingData {
                    object: "embedding".to_string(),
                    index: d.index,
                    embedding: d.embedding,
                })
                .collect(),
            model: model.to_string(),
            usage,
        };
        let body = serde_json::to_vec(&canonical)
            .map_err(|e| RelayError::internal("marshal_response_failed", e.to_string()))?;
        return Ok((body.into(), usage));
    }

    let ernie: ErnieChatResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    if ernie.error_code != 0 {
        return Err(upstream_error(ernie.error_code, ernie.error_msg));
    }
    let usage = ernie.usage.unwrap_or_default();
    let canonical = ChatResponse::assistant_text(model, ernie.result, usage);
    let body = serde_json::to_vec(&canonical)
        .map_err(|e| RelayError::internal("marshal_response_failed", e.to_string()))?;
    Ok((body.into(), usage))
}

pub async fn relay_stream(
    resp: reqwest::Response,
    sink: StreamSink,
    model: &str,
) -> Result<Usage> {
    let mut lines = Box::pin(response_lines(resp));
    let mut usage = Usage::default();

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<ErnieChatResponse>(payload) else {
            continue;
        };
        if event.error_code != 0 {
            return Err(upstream_error(event.error_code, event.error_msg));
        }
        if let Some(u) = event.usage {
            if u.total_tokens > 0 {
                usage = u;
            }
        }
        let mut chunk = StreamChunk::content(model, event.result);
        if event.is_end {
            chunk.choices[0].finish_reason = Some("stop".to_string());
        }
        if !sink.send_json(&chunk).await {
            break;
        }
        if event.is_end {
            break;
        }
    }
    Ok(usage)
}

fn upstream_error(code: i64, message: String) -> RelayError {
    RelayError::Upstream {
        status: 500,
        error: ErrorBody {
            message,
            kind: "ernie_error".to_string(),
            param: None,
            code: serde_json::json!(code),
        },
    }
}

pub fn parse_error(bytes: &[u8]) -> Option<ErrorBody> {
    #[derive(Deserialize)]
    struct Envelope {
        error_code: i64,
        #[serde(default)]
        error_msg: String,
    }
    serde_json::from_slice::<Envelope>(bytes).ok().map(|e| ErrorBody {
        message: e.error_msg,
        kind: "ernie_error".to_string(),
        param: None,
        code: serde_json::json!(e.error_code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_per_model() {
        assert_eq!(endpoint_for("ERNIE-Bot"), "completions");
        assert_eq!(endpoint_for("ERNIE-Bot-turbo"), "eb-instant");
        assert_eq!(endpoint_for("ERNIE-Bot-4"), "completions_pro");
        assert_eq!(endpoint_for("BLOOMZ-7B"), "bloomz_7b1");
        assert_eq!(endpoint_for("Embedding-V1"), "embedding-v1");
    }

    #[test]
    fn error_envelope_parses() {
        let parsed = parse_error(br#"{"error_code":110,"error_msg":"token expired"}"#).unwrap();
        assert_eq!(parsed.message, "token expired");
        assert_eq!(parsed.code, serde_json::json!(110));
    }

    #[tokio::test]
    async fn malformed_credential_is_config_error() {
        let client = reqwest::Client::new();
        let err = access_token("not-composite", &client).await.unwrap_err();
        assert!(matches!(err, RelayError::AuthConfig { provider: "ernie", .. }));
    }
}
