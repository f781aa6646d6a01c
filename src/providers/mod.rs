//! Translator set: per-provider request and response adapters between the
//! canonical schema and each vendor's native wire shape.

pub mod aiproxy;
pub mod anthropic;
pub mod dashscope;
pub mod ernie;
pub mod hunyuan;
pub mod openai;
pub mod openai_web;
pub mod palm;
pub mod spark;
pub mod zhipu;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use crate::error::{ErrorBody, RelayError, Result};
use crate::model::{ChannelId, ProviderKind, RelayMode};
use crate::relay::stream::StreamSink;
use crate::schema::{GeneralRequest, Usage};

/// Per-call channel context handed to request adapters: resolved URL roots,
/// the provider credential, and single-call admin overrides.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub channel_id: ChannelId,
    pub kind: ProviderKind,
    pub key: String,
    pub base_url: String,
    /// Admin-set single-call override; replaces the derived URL entirely.
    pub full_url: Option<String>,
    pub library_id: Option<String>,
    pub api_version: Option<String>,
}

/// Output of a request adapter. `headers` is a patch applied on top of the
/// defaults; `body` is ready to send.
#[derive(Debug)]
pub struct AdaptedRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AdaptedRequest {
    pub fn json(url: String, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self { url, headers, body }
    }
}

/// Canonical `Authorization` handling: the outbound request carries the
/// channel credential, except that an inbound bearer containing the literal
/// substring `ignore` strips the outbound header entirely. That rule is a
/// deliberate forwarding convenience (the upstream is expected to be an
/// already-authenticated proxy hop) and callers rely on it.
pub fn apply_authorization(headers: &mut HeaderMap, inbound_bearer: &str, channel_key: &str) {
    if inbound_bearer.contains("ignore") {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {channel_key}")) {
        headers.insert(AUTHORIZATION, value);
    }
}

/// Canonical → native. Ernie is async because it exchanges its credential
/// for an access token on first use.
pub async fn build_request(
    ctx: &ChannelContext,
    mode: RelayMode,
    req: &GeneralRequest,
    raw_body: &Bytes,
    model_remapped: bool,
    outbound_model: &str,
    inbound_bearer: &str,
    http: &reqwest::Client,
) -> Result<AdaptedRequest> {
    match ctx.kind {
        ProviderKind::OpenAi | ProviderKind::Azure => openai::build_request(
            ctx,
            mode,
            req,
            raw_body,
            model_remapped,
            outbound_model,
            inbound_bearer,
        ),
        ProviderKind::AnthropicClaude => {
            anthropic::build_request(ctx, req, outbound_model, inbound_bearer)
        }
        ProviderKind::GooglePalm => palm::build_request(ctx, req),
        ProviderKind::BaiduErnie => ernie::build_request(ctx, req, outbound_model, http).await,
        ProviderKind::Zhipu => zhipu::build_request(ctx, req, outbound_model).await,
        ProviderKind::AlibabaDashScope => {
            dashscope::build_request(ctx, mode, req, outbound_model, inbound_bearer)
        }
        ProviderKind::AiProxyLibrary => aiproxy::build_request(ctx, req, inbound_bearer),
        ProviderKind::TencentHunyuan => hunyuan::build_request(ctx, req),
        ProviderKind::OpenAiWeb => openai_web::build_request(ctx, req, outbound_model),
        ProviderKind::XunfeiSpark => Err(RelayError::internal(
            "spark_owns_dispatch",
            "the spark adapter dispatches over its own websocket",
        )),
    }
}

/// Native → canonical, non-streaming. Returns the body to relay to the
/// caller plus the usage for settlement.
pub async fn relay_non_stream(
    kind: ProviderKind,
    resp: reqwest::Response,
    mode: RelayMode,
    model: &str,
    prompt_tokens: u32,
) -> Result<(Bytes, Usage)> {
    match kind {
        ProviderKind::OpenAi | ProviderKind::Azure => {
            openai::relay_non_stream(resp, mode, model, prompt_tokens).await
        }
        ProviderKind::AnthropicClaude => {
            anthropic::relay_non_stream(resp, model, prompt_tokens).await
        }
        ProviderKind::GooglePalm => palm::relay_non_stream(resp, model, prompt_tokens).await,
        ProviderKind::BaiduErnie => ernie::relay_non_stream(resp, mode, model).await,
        ProviderKind::Zhipu => zhipu::relay_non_stream(resp, model).await,
        ProviderKind::AlibabaDashScope => {
            dashscope::relay_non_stream(resp, mode, model).await
        }
        ProviderKind::AiProxyLibrary => aiproxy::relay_non_stream(resp, model, prompt_tokens).await,
        ProviderKind::TencentHunyuan => hunyuan::relay_non_stream(resp, model).await,
        ProviderKind::OpenAiWeb => openai_web::relay_non_stream(resp, model, prompt_tokens).await,
        ProviderKind::XunfeiSpark => Err(RelayError::internal(
            "spark_owns_dispatch",
            "the spark adapter dispatches over its own websocket",
        )),
    }
}

/// Native → canonical, streaming. Writes canonical frames to `sink` as they
/// arrive and returns the usage once the upstream closes.
pub async fn relay_stream(
    kind: ProviderKind,
    resp: reqwest::Response,
    sink: StreamSink,
    mode: RelayMode,
    model: &str,
    prompt_tokens: u32,
) -> Result<Usage> {
    match kind {
        ProviderKind::OpenAi | ProviderKind::Azure => {
            openai::relay_stream(resp, sink, mode, model, prompt_tokens).await
        }
        ProviderKind::AnthropicClaude => {
            anthropic::relay_stream(resp, sink, model, prompt_tokens).await
        }
        ProviderKind::GooglePalm => palm::relay_stream(resp, sink, model, prompt_tokens).await,
        ProviderKind::BaiduErnie => ernie::relay_stream(resp, sink, model).await,
        ProviderKind::Zhipu => zhipu::relay_stream(resp, sink, model).await,
        ProviderKind::AlibabaDashScope => dashscope::relay_stream(resp, sink, model).await,
        ProviderKind::AiProxyLibrary => {
            aiproxy::relay_stream(resp, sink, model, prompt_tokens).await
        }
        ProviderKind::TencentHunyuan => hunyuan::relay_stream(resp, sink, model, prompt_tokens).await,
        ProviderKind::OpenAiWeb => {
            openai_web::relay_stream(resp, sink, model, prompt_tokens).await
        }
        ProviderKind::XunfeiSpark => Err(RelayError::internal(
            "spark_owns_dispatch",
            "the spark adapter dispatches over its own websocket",
        )),
    }
}

/// Translates an upstream non-2xx body into the canonical error envelope,
/// preserving the upstream status code.
pub async fn upstream_error(kind: ProviderKind, resp: reqwest::Response) -> RelayError {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.unwrap_or_default();
    let error = parse_error_body(kind, &bytes);
    RelayError::Upstream { status, error }
}

/// Upstream body as a line stream, for SSE-style responses.
pub(crate) fn response_lines(
    resp: reqwest::Response,
) -> impl Stream<Item = std::io::Result<String>> {
    use tokio::io::AsyncBufReadExt;

    let byte_stream = resp
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));
    LinesStream::new(reader.lines())
}

/// Strips the SSE `data:` prefix; returns None for keep-alives, comments and
/// blank lines.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix("data:")
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
}

fn parse_error_body(kind: ProviderKind, bytes: &[u8]) -> ErrorBody {
    let parsed = match kind {
        ProviderKind::BaiduErnie => ernie::parse_error(bytes),
        ProviderKind::Zhipu => zhipu::parse_error(bytes),
        ProviderKind::AlibabaDashScope => dashscope::parse_error(bytes),
        ProviderKind::TencentHunyuan => hunyuan::parse_error(bytes),
        _ => openai::parse_error(bytes),
    };
    parsed.unwrap_or_else(|| {
        ErrorBody::new(
            String::from_utf8_lossy(bytes).into_owned(),
            "upstream_error",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_bearer_strips_authorization() {
        let mut headers = HeaderMap::new();
        apply_authorization(&mut headers, "sk-ignore-debug", "channel-key");
        assert!(headers.get(AUTHORIZATION).is_none());

        apply_authorization(&mut headers, "sk-normal", "channel-key");
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap(),
            "Bearer channel-key"
        );
    }

    #[test]
    fn unparseable_error_body_degrades_to_text() {
        let body = parse_error_body(ProviderKind::OpenAi, b"gateway exploded");
        assert_eq!(body.message, "gateway exploded");
        assert_eq!(body.code, serde_json::json!("upstream_error"));
    }
}
