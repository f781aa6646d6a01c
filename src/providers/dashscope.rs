//! Alibaba DashScope adapter. Generation and embedding live on distinct
//! fixed URLs; streaming is requested with the `X-DashScope-SSE: enable`
//! header and delivers cumulative text, so deltas are computed against the
//! previously forwarded prefix.

use futures::StreamExt;
use http::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorBody, RelayError, Result};
use crate::model::RelayMode;
use crate::relay::stream::StreamSink;
use crate::schema::{
    ChatResponse, EmbeddingData, EmbeddingResponse, GeneralRequest, StreamChunk, Usage,
};

use super::{apply_authorization, response_lines, sse_data, AdaptedRequest, ChannelContext};

const GENERATION_PATH: &str = "/api/v1/services/aigc/text-generation/generation";
const EMBEDDING_PATH: &str = "/api/v1/services/embeddings/text-embedding/text-embedding";

#[derive(Debug, Serialize)]
struct DashScopeRequest {
    model: String,
    input: DashScopeInput,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DashScopeInput {
    Chat { messages: Vec<DashScopeMessage> },
    Embedding { texts: Vec<String> },
}

#[derive(Debug, Serialize)]
struct DashScopeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct DashScopeResponse {
    #[serde(default)]
    output: Option<DashScopeOutput>,
    #[serde(default)]
    usage: Option<DashScopeUsage>,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize, Default)]
struct DashScopeOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: String,
    #[serde(default)]
    embeddings: Vec<DashScopeEmbedding>,
}

#[derive(Debug, Deserialize)]
struct DashScopeEmbedding {
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    text_index: u32,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct DashScopeUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl DashScopeUsage {
    fn canonical(self) -> Usage {
        if self.total_tokens > 0 && self.input_tokens == 0 {
            Usage {
                prompt_tokens: self.total_tokens,
                completion_tokens: 0,
                total_tokens: self.total_tokens,
            }
        } else {
            Usage::new(self.input_tokens, self.output_tokens)
        }
    }
}

pub fn build_request(
    ctx: &ChannelContext,
    mode: RelayMode,
    req: &GeneralRequest,
    outbound_model: &str,
    inbound_bearer: &str,
) -> Result<AdaptedRequest> {
    let base = ctx.base_url.trim_end_matches('/');
    let (url, input) = if mode == RelayMode::Embeddings {
        let texts = match req.input.as_ref() {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        (
            format!("{base}{EMBEDDING_PATH}/{outbound_model}"),
            DashScopeInput::Embedding { texts },
        )
    } else {
        (
            format!("{base}{GENERATION_PATH}"),
            DashScopeInput::Chat {
                messages: req
                    .messages
                    .iter()
                    .map(|m| DashScopeMessage {
                        role: m.role.clone(),
                        content: m.content.clone(),
                    })
                    .collect(),
            },
        )
    };

    let body = serde_json::to_vec(&DashScopeRequest {
        model: outbound_model.to_string(),
        input,
        parameters: serde_json::json!({}),
    })
    .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;

    let mut adapted = AdaptedRequest::json(ctx.full_url.clone().unwrap_or(url), body.into());
    apply_authorization(&mut adapted.headers, inbound_bearer, &ctx.key);
    if req.stream {
        adapted
            .headers
            .insert("X-DashScope-SSE", HeaderValue::from_static("enable"));
    }
    Ok(adapted)
}

fn check_error(resp: &DashScopeResponse) -> Result<()> {
    if resp.code.is_empty() {
        return Ok(());
    }
    Err(RelayError::Upstream {
        status: 500,
        error: ErrorBody {
            message: resp.message.clone(),
            kind: "dashscope_error".to_string(),
            param: None,
            code: serde_json::json!(resp.code),
        },
    })
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    mode: RelayMode,
    model: &str,
) -> Result<(bytes::Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    let parsed: DashScopeResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    check_error(&parsed)?;
    let usage = parsed.usage.unwrap_or_default().canonical();
    let output = parsed.output.unwrap_or_default();

    let body = if mode == RelayMode::Embeddings {
        let canonical = EmbeddingResponse {
            object: "list".to_string(),
            data: output
                .embeddings
                .into_iter()
                .map(|e| EmbeddingData {
                    object: "embedding".to_string(),
                    index: e.text_index,
                    embedding: e.embedding,
                })
                .collect(),
            model: model.to_string(),
            usage,
        };
        serde_json::to_vec(&canonical)
    } else {
        serde_json::to_vec(&ChatResponse::assistant_text(model, output.text, usage))
    }
    .map_err(|e| RelayError::internal("marshal_response_failed", e.to_string()))?;
    Ok((body.into(), usage))
}

/// Stream frames carry the whole text so far; only the unseen suffix is
/// forwarded.
pub async fn relay_stream(
    resp: reqwest::Response,
    sink: StreamSink,
    model: &str,
) -> Result<Usage> {
    let mut lines = Box::pin(response_lines(resp));
    let mut forwarded = String::new();
    let mut usage = Usage::default();

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<DashScopeResponse>(payload) else {
            continue;
        };
        check_error(&event)?;
        if let Some(u) = event.usage {
            usage = u.canonical();
        }
        let Some(output) = event.output else {
            continue;
        };
        let delta = output
            .text
            .strip_prefix(forwarded.as_str())
            .unwrap_or(&output.text)
            .to_string();
        forwarded = output.text.clone();

        let finished = !output.finish_reason.is_empty() && output.finish_reason != "null";
        let mut chunk = StreamChunk::content(model, delta);
        if finished {
            chunk.choices[0].finish_reason = Some(output.finish_reason.clone());
        }
        if !sink.send_json(&chunk).await {
            break;
        }
        if finished {
            break;
        }
    }
    Ok(usage)
}

pub fn parse_error(bytes: &[u8]) -> Option<ErrorBody> {
    #[derive(Deserialize)]
    struct Envelope {
        code: String,
        #[serde(default)]
        message: String,
    }
    serde_json::from_slice::<Envelope>(bytes).ok().map(|e| ErrorBody {
        message: e.message,
        kind: "dashscope_error".to_string(),
        param: None,
        code: serde_json::json!(e.code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChatMessage;

    fn ctx() -> ChannelContext {
        ChannelContext {
            channel_id: 1,
            kind: crate::model::ProviderKind::AlibabaDashScope,
            key: "ds-key".into(),
            base_url: "https://dashscope.aliyuncs.com".into(),
            full_url: None,
            library_id: None,
            api_version: None,
        }
    }

    #[test]
    fn stream_header_only_when_streaming() {
        let mut req = GeneralRequest {
            model: "qwen-turbo".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            ..Default::default()
        };
        let adapted =
            build_request(&ctx(), RelayMode::ChatCompletions, &req, "qwen-turbo", "sk-x").unwrap();
        assert!(adapted.headers.get("X-DashScope-SSE").is_none());

        req.stream = true;
        let adapted =
            build_request(&ctx(), RelayMode::ChatCompletions, &req, "qwen-turbo", "sk-x").unwrap();
        assert_eq!(adapted.headers.get("X-DashScope-SSE").unwrap(), "enable");
    }

    #[test]
    fn embedding_url_is_distinct() {
        let req = GeneralRequest {
            model: "text-embedding-v1".into(),
            input: Some(serde_json::json!(["a", "b"])),
            ..Default::default()
        };
        let adapted = build_request(
            &ctx(),
            RelayMode::Embeddings,
            &req,
            "text-embedding-v1",
            "sk-x",
        )
        .unwrap();
        assert!(adapted.url.contains("/embeddings/text-embedding/"));
        let body: serde_json::Value = serde_json::from_slice(&adapted.body).unwrap();
        assert_eq!(body["input"]["texts"][1], "b");
    }

    #[test]
    fn usage_without_split_falls_back_to_total() {
        let u = DashScopeUsage {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 9,
        };
        let canonical = u.canonical();
        assert_eq!(canonical.prompt_tokens, 9);
        assert_eq!(canonical.total_tokens, 9);
    }
}
