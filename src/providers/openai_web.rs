//! Reverse-proxied OpenAI web conversation endpoint. The upstream expects
//! browser-shaped traffic, so outbound requests carry spoofed client-IP
//! headers drawn from a fixed set of plausible ranges. Stream frames carry
//! the whole answer so far; deltas are the unseen suffix.

use futures::StreamExt;
use http::header::HeaderValue;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::counter;
use crate::error::{RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::{apply_authorization, response_lines, sse_data, AdaptedRequest, ChannelContext};

const IP_PREFIXES: &[&str] = &["8.21.4", "13.52.18", "20.171.206", "52.53.146"];

#[derive(Debug, Serialize)]
struct ConversationRequest {
    action: String,
    messages: Vec<ConversationMessage>,
    model: String,
    parent_message_id: String,
}

#[derive(Debug, Serialize)]
struct ConversationMessage {
    id: String,
    author: Author,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
struct Author {
    role: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct MessageContent {
    content_type: String,
    #[serde(default)]
    parts: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConversationEvent {
    #[serde(default)]
    message: Option<EventMessage>,
}

#[derive(Debug, Deserialize, Default)]
struct EventMessage {
    #[serde(default)]
    content: MessageContent,
}

fn spoofed_ip() -> String {
    let mut rng = rand::thread_rng();
    let prefix = IP_PREFIXES[rng.gen_range(0..IP_PREFIXES.len())];
    format!("{prefix}.{}", rng.gen_range(1..=254))
}

pub fn build_request(
    ctx: &ChannelContext,
    req: &GeneralRequest,
    outbound_model: &str,
) -> Result<AdaptedRequest> {
    let messages = req
        .messages
        .iter()
        .map(|m| ConversationMessage {
            id: uuid::Uuid::new_v4().to_string(),
            author: Author {
                role: m.role.clone(),
            },
            content: MessageContent {
                content_type: "text".to_string(),
                parts: vec![m.content.clone()],
            },
        })
        .collect();
    let body = serde_json::to_vec(&ConversationRequest {
        action: "next".to_string(),
        messages,
        model: outbound_model.to_string(),
        parent_message_id: uuid::Uuid::new_v4().to_string(),
    })
    .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;

    let url = ctx.full_url.clone().unwrap_or_else(|| {
        format!(
            "{}/backend-api/conversation",
            ctx.base_url.trim_end_matches('/')
        )
    });
    let mut adapted = AdaptedRequest::json(url, body.into());
    apply_authorization(&mut adapted.headers, "", &ctx.key);
    let ip = spoofed_ip();
    for header in ["x-real-ip", "x-forwarded-for", "remote-host"] {
        if let Ok(value) = HeaderValue::from_str(&ip) {
            adapted.headers.insert(header, value);
        }
    }
    Ok(adapted)
}

fn text_of(event: &ConversationEvent) -> Option<&str> {
    event
        .message
        .as_ref()
        .and_then(|m| m.content.parts.first())
        .map(String::as_str)
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    model: &str,
    prompt_tokens: u32,
) -> Result<(bytes::Bytes, Usage)> {
    // the conversation endpoint always streams; collect it into one answer
    let mut lines = Box::pin(response_lines(resp));
    let mut last = String::new();
    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        if payload == crate::relay::stream::DONE_FRAME {
            break;
        }
        if let Ok(event) = serde_json::from_str::<ConversationEvent>(payload) {
            if let Some(text) = text_of(&event) {
                last = text.to_string();
            }
        }
    }
    let usage = Usage::new(prompt_tokens, counter::count_text(&last, model));
    let canonical = ChatResponse::assistant_text(model, last, usage);
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
    let mut forwarded = String::new();

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        if payload == crate::relay::stream::DONE_FRAME {
            sink.send_json(&StreamChunk::finish(model, "stop")).await;
            break;
        }
        let Ok(event) = serde_json::from_str::<ConversationEvent>(payload) else {
            continue;
        };
        let Some(text) = text_of(&event) else {
            continue;
        };
        let delta = text.strip_prefix(forwarded.as_str()).unwrap_or(text).to_string();
        forwarded = text.to_string();
        if delta.is_empty() {
            continue;
        }
        if !sink.send_json(&StreamChunk::content(model, delta)).await {
            break;
        }
    }

    Ok(Usage::new(
        prompt_tokens,
        counter::count_text(&forwarded, model),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChatMessage;

    #[test]
    fn spoofed_ip_comes_from_known_ranges() {
        for _ in 0..20 {
            let ip = spoofed_ip();
            assert!(IP_PREFIXES.iter().any(|p| ip.starts_with(p)), "{ip}");
        }
    }

    #[test]
    fn conversation_path_and_headers() {
        let ctx = ChannelContext {
            channel_id: 1,
            kind: crate::model::ProviderKind::OpenAiWeb,
            key: "sess-key".into(),
            base_url: "https://chat.openai.com".into(),
            full_url: None,
            library_id: None,
            api_version: None,
        };
        let req = GeneralRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            ..Default::default()
        };
        let adapted = build_request(&ctx, &req, "text-davinci-002-render-sha").unwrap();
        assert_eq!(adapted.url, "https://chat.openai.com/backend-api/conversation");
        for header in ["x-real-ip", "x-forwarded-for", "remote-host"] {
            assert!(adapted.headers.get(header).is_some());
        }
        let body: serde_json::Value = serde_json::from_slice(&adapted.body).unwrap();
        assert_eq!(body["action"], "next");
        assert_eq!(body["messages"][0]["content"]["parts"][0], "hi");
    }
}
