//! Google PaLM chat adapter (`chat-bison-001`). The upstream has no
//! streaming endpoint; a streamed relay is emulated by sending the full
//! answer as a single chunk.

use serde::{Deserialize, Serialize};

use crate::counter;
use crate::error::{ErrorBody, RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::{AdaptedRequest, ChannelContext};

#[derive(Debug, Serialize)]
struct PalmRequest {
    prompt: PalmPrompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(rename = "candidateCount")]
    candidate_count: u32,
}

#[derive(Debug, Serialize)]
struct PalmPrompt {
    messages: Vec<PalmMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PalmMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct PalmResponse {
    #[serde(default)]
    candidates: Vec<PalmMessage>,
    #[serde(default)]
    error: Option<PalmError>,
}

#[derive(Debug, Deserialize)]
struct PalmError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

pub fn build_request(ctx: &ChannelContext, req: &GeneralRequest) -> Result<AdaptedRequest> {
    let body = PalmRequest {
        prompt: PalmPrompt {
            messages: req
                .messages
                .iter()
                .map(|m| PalmMessage {
                    content: m.content.clone(),
                })
                .collect(),
        },
        temperature: req.temperature,
        top_p: req.top_p,
        candidate_count: req.n.unwrap_or(1),
    };
    let bytes = serde_json::to_vec(&body)
        .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;
    let url = ctx.full_url.clone().unwrap_or_else(|| {
        format!(
            "{}/v1beta2/models/chat-bison-001:generateMessage?key={}",
            ctx.base_url.trim_end_matches('/'),
            ctx.key
        )
    });
    Ok(AdaptedRequest::json(url, bytes.into()))
}

fn first_candidate(resp: &PalmResponse) -> String {
    resp.candidates
        .first()
        .map(|c| c.content.clone())
        .unwrap_or_default()
}

async fn read_response(resp: reqwest::Response) -> Result<PalmResponse> {
    let bytes = resp.bytes().await?;
    let palm: PalmResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    if let Some(error) = &palm.error {
        if !error.message.is_empty() {
            return Err(RelayError::Upstream {
                status: 500,
                error: ErrorBody::new(error.message.clone(), &error.status),
            });
        }
    }
    Ok(palm)
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    model: &str,
    prompt_tokens: u32,
) -> Result<(bytes::Bytes, Usage)> {
    let palm = read_response(resp).await?;
    let content = first_candidate(&palm);
    let usage = Usage::new(prompt_tokens, counter::count_text(&content, model));
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
    let palm = read_response(resp).await?;
    let content = first_candidate(&palm);
    let usage = Usage::new(prompt_tokens, counter::count_text(&content, model));
    let mut chunk = StreamChunk::content(model, content);
    chunk.choices[0].finish_reason = Some("stop".to_string());
    sink.send_json(&chunk).await;
    Ok(usage)
}
