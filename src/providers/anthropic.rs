//! Anthropic Claude text-completion adapter. Chat messages are folded into
//! the `\n\nHuman:`/`\n\nAssistant:` transcript format; Claude reports no
//! token usage, so completion tokens are counted locally.

use http::header::HeaderValue;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::counter;
use crate::error::{ErrorBody, RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::{response_lines, sse_data, AdaptedRequest, ChannelContext};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    prompt: String,
    max_tokens_to_sample: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    #[serde(default)]
    completion: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    error: Option<ClaudeError>,
}

#[derive(Debug, Deserialize)]
struct ClaudeError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

fn transcript(req: &GeneralRequest) -> String {
    let mut prompt = String::new();
    for message in &req.messages {
        match message.role.as_str() {
            "user" => prompt.push_str(&format!("\n\nHuman: {}", message.content)),
            "assistant" => prompt.push_str(&format!("\n\nAssistant: {}", message.content)),
            _ => prompt.push_str(&format!("\n\nSystem: {}", message.content)),
        }
    }
    prompt.push_str("\n\nAssistant:");
    prompt
}

fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    match reason {
        Some("stop_sequence") => Some("stop".to_string()),
        Some("max_tokens") => Some("length".to_string()),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

pub fn build_request(
    ctx: &ChannelContext,
    req: &GeneralRequest,
    outbound_model: &str,
    inbound_bearer: &str,
) -> Result<AdaptedRequest> {
    let body = ClaudeRequest {
        model: outbound_model.to_string(),
        prompt: transcript(req),
        max_tokens_to_sample: req.max_tokens.unwrap_or(1_000_000),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: Vec::new(),
        stream: req.stream,
    };
    let bytes = serde_json::to_vec(&body)
        .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;

    let url = ctx
        .full_url
        .clone()
        .unwrap_or_else(|| format!("{}/v1/complete", ctx.base_url.trim_end_matches('/')));
    let mut adapted = AdaptedRequest::json(url, bytes.into());
    if !inbound_bearer.contains("ignore") {
        let value = HeaderValue::from_str(&ctx.key).map_err(|_| RelayError::AuthConfig {
            provider: "claude",
            message: "credential is not a valid header value".to_string(),
        })?;
        adapted.headers.insert("x-api-key", value);
    }
    adapted.headers.insert(
        "anthropic-version",
        HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
    );
    Ok(adapted)
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    model: &str,
    prompt_tokens: u32,
) -> Result<(bytes::Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    let claude: ClaudeResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    if let Some(error) = claude.error {
        if !error.message.is_empty() {
            return Err(RelayError::Upstream {
                status: 500,
                error: ErrorBody::new(error.message, &error.kind),
            });
        }
    }
    let completion = claude.completion.trim_start().to_string();
    let usage = Usage::new(prompt_tokens, counter::count_text(&completion, model));
    let mut canonical = ChatResponse::assistant_text(model, completion, usage);
    canonical.choices[0].finish_reason = map_stop_reason(claude.stop_reason.as_deref());
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

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<ClaudeResponse>(payload) else {
            continue;
        };
        if event.completion.is_empty() && event.stop_reason.is_none() {
            continue;
        }
        collected.push_str(&event.completion);
        let mut chunk = StreamChunk::content(model, event.completion.clone());
        chunk.choices[0].finish_reason = map_stop_reason(event.stop_reason.as_deref());
        if !sink.send_json(&chunk).await {
            break;
        }
        if event.stop_reason.is_some() {
            break;
        }
    }

    Ok(Usage::new(prompt_tokens, counter::count_text(&collected, model)))
}
