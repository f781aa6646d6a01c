//! OpenAI-compatible upstreams. This adapter also carries the Azure
//! deployment URL rewrite and the Cloudflare AI Gateway path rule; both
//! speak the canonical wire shape, so the body passes through untouched
//! unless the model name was remapped.

use bytes::Bytes;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderValue};

use crate::counter;
use crate::error::{ErrorBody, RelayError, Result};
use crate::model::{ProviderKind, RelayMode};
use crate::relay::stream::StreamSink;
use crate::schema::{GeneralRequest, SniffedResponse, StreamChunk, Usage};

use super::{apply_authorization, response_lines, sse_data, AdaptedRequest, ChannelContext};

const CLOUDFLARE_GATEWAY_PREFIX: &str = "https://gateway.ai.cloudflare.com";

/// Azure deployment names cannot carry dots or the dated model suffixes.
/// `gpt-4.0613` becomes `gpt-4`.
pub fn sanitize_azure_model(model: &str) -> String {
    let mut name = model.replace('.', "");
    for suffix in ["-0301", "-0314", "-0613"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.to_string();
            break;
        }
    }
    name
}

pub fn build_url(ctx: &ChannelContext, mode: RelayMode, outbound_model: &str) -> String {
    if let Some(full) = &ctx.full_url {
        return full.clone();
    }
    let base = ctx.base_url.trim_end_matches('/');
    let task = mode.task_path();
    if ctx.kind == ProviderKind::Azure {
        let deployment = sanitize_azure_model(outbound_model);
        let api_version = ctx.api_version.as_deref().unwrap_or("2023-05-15");
        return format!("{base}/openai/deployments/{deployment}/{task}?api-version={api_version}");
    }
    if base.starts_with(CLOUDFLARE_GATEWAY_PREFIX) {
        // the gateway already encodes /v1 in its own path
        return format!("{base}/{task}");
    }
    format!("{base}/v1/{task}")
}

pub fn build_request(
    ctx: &ChannelContext,
    mode: RelayMode,
    req: &GeneralRequest,
    raw_body: &Bytes,
    model_remapped: bool,
    outbound_model: &str,
    inbound_bearer: &str,
) -> Result<AdaptedRequest> {
    let body = if model_remapped {
        let mut outbound = req.clone();
        outbound.model = outbound_model.to_string();
        Bytes::from(serde_json::to_vec(&outbound).map_err(|e| {
            RelayError::internal("marshal_request_failed", e.to_string())
        })?)
    } else {
        raw_body.clone()
    };

    let mut adapted = AdaptedRequest::json(build_url(ctx, mode, outbound_model), body);
    if ctx.kind == ProviderKind::Azure {
        let value = HeaderValue::from_str(&ctx.key)
            .map_err(|_| RelayError::AuthConfig {
                provider: "azure",
                message: "credential is not a valid header value".to_string(),
            })?;
        adapted.headers.insert("api-key", value);
    } else {
        apply_authorization(&mut adapted.headers, inbound_bearer, &ctx.key);
    }
    Ok(adapted)
}

/// Relays the upstream body verbatim. Usage comes from the body when the
/// upstream reports it; otherwise completion tokens are counted from the
/// choice texts so billing never depends on upstream cooperation.
pub async fn relay_non_stream(
    resp: reqwest::Response,
    _mode: RelayMode,
    model: &str,
    prompt_tokens: u32,
) -> Result<(Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    let sniffed: SniffedResponse = serde_json::from_slice(&bytes).unwrap_or_default();
    if let Some(error) = sniffed.error {
        if !error.is_empty() {
            return Err(RelayError::Upstream { status: 500, error });
        }
    }
    let usage = match sniffed.usage {
        Some(usage) if usage.total_tokens > 0 => usage,
        _ => {
            let completion: u32 = sniffed
                .choices
                .iter()
                .map(|choice| {
                    let text = choice
                        .message
                        .as_ref()
                        .map(|m| m.content.as_str())
                        .or(choice.text.as_deref())
                        .unwrap_or_default();
                    counter::count_text(text, model)
                })
                .sum();
            Usage::new(prompt_tokens, completion)
        }
    };
    Ok((bytes, usage))
}

/// Proxies SSE frames verbatim while accumulating delta text so completion
/// tokens can be counted after the upstream closes.
pub async fn relay_stream(
    resp: reqwest::Response,
    sink: StreamSink,
    mode: RelayMode,
    model: &str,
    prompt_tokens: u32,
) -> Result<Usage> {
    let mut lines = Box::pin(response_lines(resp));
    let mut collected = String::new();
    let mut reported_usage: Option<Usage> = None;

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        if payload == crate::relay::stream::DONE_FRAME {
            break;
        }
        accumulate_delta(payload, mode, &mut collected, &mut reported_usage);
        if !sink.send_data(payload).await {
            // caller went away; stop reading the upstream
            break;
        }
    }

    Ok(reported_usage
        .unwrap_or_else(|| Usage::new(prompt_tokens, counter::count_text(&collected, model))))
}

fn accumulate_delta(
    payload: &str,
    mode: RelayMode,
    collected: &mut String,
    reported_usage: &mut Option<Usage>,
) {
    if mode == RelayMode::Completions {
        #[derive(serde::Deserialize)]
        struct TextChunk {
            #[serde(default)]
            choices: Vec<TextChoice>,
            #[serde(default)]
            usage: Option<Usage>,
        }
        #[derive(serde::Deserialize)]
        struct TextChoice {
            #[serde(default)]
            text: String,
        }
        if let Ok(chunk) = serde_json::from_str::<TextChunk>(payload) {
            for choice in &chunk.choices {
                collected.push_str(&choice.text);
            }
            if let Some(usage) = chunk.usage {
                if usage.total_tokens > 0 {
                    *reported_usage = Some(usage);
                }
            }
        }
        return;
    }
    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) {
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                collected.push_str(content);
            }
        }
    }
}

pub fn parse_error(bytes: &[u8]) -> Option<ErrorBody> {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: ErrorBody,
    }
    serde_json::from_slice::<Envelope>(bytes)
        .ok()
        .map(|e| e.error)
        .filter(|e| !e.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelId;

    fn ctx(kind: ProviderKind, base_url: &str) -> ChannelContext {
        ChannelContext {
            channel_id: 1 as ChannelId,
            kind,
            key: "sk-upstream".into(),
            base_url: base_url.into(),
            full_url: None,
            library_id: None,
            api_version: None,
        }
    }

    #[test]
    fn azure_model_sanitization() {
        assert_eq!(sanitize_azure_model("gpt-4.0613"), "gpt-4");
        assert_eq!(sanitize_azure_model("gpt-3.5-turbo-0301"), "gpt-35-turbo");
        assert_eq!(sanitize_azure_model("gpt-4-0314"), "gpt-4");
        assert_eq!(sanitize_azure_model("gpt-4"), "gpt-4");
    }

    #[test]
    fn azure_url_rewrite() {
        let mut c = ctx(ProviderKind::Azure, "https://my.openai.azure.com");
        c.api_version = Some("2023-07-01".into());
        let url = build_url(&c, RelayMode::ChatCompletions, "gpt-4.0613");
        assert_eq!(
            url,
            "https://my.openai.azure.com/openai/deployments/gpt-4/chat/completions?api-version=2023-07-01"
        );
    }

    #[test]
    fn cloudflare_gateway_strips_v1() {
        let c = ctx(
            ProviderKind::OpenAi,
            "https://gateway.ai.cloudflare.com/v1/acct/gw/openai",
        );
        let url = build_url(&c, RelayMode::ChatCompletions, "gpt-3.5-turbo");
        assert_eq!(
            url,
            "https://gateway.ai.cloudflare.com/v1/acct/gw/openai/chat/completions"
        );
    }

    #[test]
    fn plain_openai_url() {
        let c = ctx(ProviderKind::OpenAi, "https://api.openai.com");
        assert_eq!(
            build_url(&c, RelayMode::Embeddings, "text-embedding-ada-002"),
            "https://api.openai.com/v1/embeddings"
        );
    }

    #[test]
    fn full_url_override_wins() {
        let mut c = ctx(ProviderKind::OpenAi, "https://api.openai.com");
        c.full_url = Some("https://proxy.example/custom".into());
        assert_eq!(
            build_url(&c, RelayMode::ChatCompletions, "gpt-4"),
            "https://proxy.example/custom"
        );
    }

    #[test]
    fn azure_uses_api_key_header() {
        let c = ctx(ProviderKind::Azure, "https://my.openai.azure.com");
        let req = GeneralRequest {
            model: "gpt-4".into(),
            ..Default::default()
        };
        let adapted = build_request(
            &c,
            RelayMode::ChatCompletions,
            &req,
            &Bytes::from_static(b"{}"),
            false,
            "gpt-4",
            "sk-caller",
        )
        .unwrap();
        assert_eq!(adapted.headers.get("api-key").unwrap(), "sk-upstream");
        assert!(adapted.headers.get(http::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn passthrough_body_is_byte_identical_without_remap() {
        let c = ctx(ProviderKind::OpenAi, "https://api.openai.com");
        let raw = Bytes::from_static(b"{\"model\":\"gpt-4\",\"messages\":[],\"x\":1}");
        let req = GeneralRequest {
            model: "gpt-4".into(),
            ..Default::default()
        };
        let adapted = build_request(
            &c,
            RelayMode::ChatCompletions,
            &req,
            &raw,
            false,
            "gpt-4",
            "sk-caller",
        )
        .unwrap();
        assert_eq!(adapted.body, raw);
    }

    #[test]
    fn remap_reserializes_with_outbound_model() {
        let c = ctx(ProviderKind::OpenAi, "https://api.openai.com");
        let raw = Bytes::from_static(b"{\"model\":\"gpt-4\"}");
        let req = GeneralRequest {
            model: "gpt-4".into(),
            ..Default::default()
        };
        let adapted = build_request(
            &c,
            RelayMode::ChatCompletions,
            &req,
            &raw,
            true,
            "gpt-4-backup",
            "sk-caller",
        )
        .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&adapted.body).unwrap();
        assert_eq!(body["model"], "gpt-4-backup");
    }

    #[test]
    fn error_envelope_parses() {
        let body = br#"{"error":{"message":"boom","type":"server_error","code":"overloaded"}}"#;
        let parsed = parse_error(body).unwrap();
        assert_eq!(parsed.message, "boom");
        assert_eq!(parsed.code, serde_json::json!("overloaded"));
        assert!(parse_error(b"not json").is_none());
    }
}
