//! AIProxy library adapter: question answering over an uploaded document
//! library. The library id rides in from the request context and goes out in
//! the body.

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::counter;
use crate::error::{RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::{apply_authorization, response_lines, sse_data, AdaptedRequest, ChannelContext};

#[derive(Debug, Serialize)]
struct LibraryRequest {
    #[serde(rename = "libraryId")]
    library_id: String,
    query: String,
    stream: bool,
}

#[derive(Debug, Deserialize, Default)]
struct LibraryResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    documents: Vec<LibraryDocument>,
}

#[derive(Debug, Deserialize)]
struct LibraryDocument {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct LibraryStreamEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    documents: Vec<LibraryDocument>,
}

/// The question is the last user turn, falling back to the bare prompt.
fn query_of(req: &GeneralRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_else(|| req.prompt_text())
}

fn references(documents: &[LibraryDocument]) -> String {
    if documents.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\n");
    for (i, doc) in documents.iter().enumerate() {
        out.push_str(&format!("[{}] [{}]({})\n", i + 1, doc.title, doc.url));
    }
    out
}

pub fn build_request(
    ctx: &ChannelContext,
    req: &GeneralRequest,
    inbound_bearer: &str,
) -> Result<AdaptedRequest> {
    let library_id = ctx.library_id.clone().ok_or_else(|| RelayError::AuthConfig {
        provider: "aiproxy",
        message: "library_id missing from request context".to_string(),
    })?;
    let body = serde_json::to_vec(&LibraryRequest {
        library_id,
        query: query_of(req),
        stream: req.stream,
    })
    .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;
    let url = ctx
        .full_url
        .clone()
        .unwrap_or_else(|| format!("{}/api/library/ask", ctx.base_url.trim_end_matches('/')));
    let mut adapted = AdaptedRequest::json(url, body.into());
    apply_authorization(&mut adapted.headers, inbound_bearer, &ctx.key);
    Ok(adapted)
}

pub async fn relay_non_stream(
    resp: reqwest::Response,
    model: &str,
    prompt_tokens: u32,
) -> Result<(bytes::Bytes, Usage)> {
    let bytes = resp.bytes().await?;
    let parsed: LibraryResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
    let content = format!("{}{}", parsed.answer, references(&parsed.documents));
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
    let mut lines = Box::pin(response_lines(resp));
    let mut collected = String::new();

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::internal("read_stream_failed", e.to_string()))?;
        let Some(payload) = sse_data(&line) else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<LibraryStreamEvent>(payload) else {
            continue;
        };
        if event.done {
            let refs = references(&event.documents);
            if !refs.is_empty() {
                collected.push_str(&refs);
                sink.send_json(&StreamChunk::content(model, refs)).await;
            }
            sink.send_json(&StreamChunk::finish(model, "stop")).await;
            break;
        }
        collected.push_str(&event.content);
        if !sink.send_json(&StreamChunk::content(model, event.content)).await {
            break;
        }
    }

    Ok(Usage::new(prompt_tokens, counter::count_text(&collected, model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChatMessage;

    #[test]
    fn missing_library_id_is_config_error() {
        let ctx = ChannelContext {
            channel_id: 1,
            kind: crate::model::ProviderKind::AiProxyLibrary,
            key: "k".into(),
            base_url: "https://api.aiproxy.io".into(),
            full_url: None,
            library_id: None,
            api_version: None,
        };
        let req = GeneralRequest::default();
        assert!(matches!(
            build_request(&ctx, &req, "sk-x").unwrap_err(),
            RelayError::AuthConfig { provider: "aiproxy", .. }
        ));
    }

    #[test]
    fn body_carries_library_id_and_query() {
        let ctx = ChannelContext {
            channel_id: 1,
            kind: crate::model::ProviderKind::AiProxyLibrary,
            key: "k".into(),
            base_url: "https://api.aiproxy.io".into(),
            full_url: None,
            library_id: Some("lib-9".into()),
            api_version: None,
        };
        let req = GeneralRequest {
            messages: vec![
                ChatMessage::new("user", "first"),
                ChatMessage::new("assistant", "a"),
                ChatMessage::new("user", "second"),
            ],
            ..Default::default()
        };
        let adapted = build_request(&ctx, &req, "sk-x").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&adapted.body).unwrap();
        assert_eq!(body["libraryId"], "lib-9");
        assert_eq!(body["query"], "second");
        assert!(adapted.url.ends_with("/api/library/ask"));
    }
}
