//! Xunfei Spark adapter. Spark speaks a websocket protocol, not HTTP, so
//! this module owns its whole dispatch loop instead of going through the
//! racing dispatcher. The handshake URL is signed with HMAC-SHA256 over the
//! host, date and request line.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{ErrorBody, RelayError, Result};
use crate::relay::stream::StreamSink;
use crate::schema::{ChatResponse, GeneralRequest, StreamChunk, Usage};

use super::ChannelContext;

const CHAT_PATH: &str = "/v1.1/chat";
const DOMAIN: &str = "general";

struct Credential {
    app_id: String,
    api_secret: String,
    api_key: String,
}

fn parse_credential(key: &str) -> Result<Credential> {
    let parts: Vec<&str> = key.split('|').collect();
    let [app_id, api_secret, api_key] = parts.as_slice() else {
        return Err(RelayError::AuthConfig {
            provider: "spark",
            message: "credential must look like appId|apiSecret|apiKey".to_string(),
        });
    };
    Ok(Credential {
        app_id: app_id.to_string(),
        api_secret: api_secret.to_string(),
        api_key: api_key.to_string(),
    })
}

/// RFC1123 date with a literal GMT zone, the only shape the handshake
/// accepts.
fn http_date(now: OffsetDateTime) -> String {
    let weekday = match now.weekday() {
        time::Weekday::Monday => "Mon",
        time::Weekday::Tuesday => "Tue",
        time::Weekday::Wednesday => "Wed",
        time::Weekday::Thursday => "Thu",
        time::Weekday::Friday => "Fri",
        time::Weekday::Saturday => "Sat",
        time::Weekday::Sunday => "Sun",
    };
    let month = match now.month() {
        time::Month::January => "Jan",
        time::Month::February => "Feb",
        time::Month::March => "Mar",
        time::Month::April => "Apr",
        time::Month::May => "May",
        time::Month::June => "Jun",
        time::Month::July => "Jul",
        time::Month::August => "Aug",
        time::Month::September => "Sep",
        time::Month::October => "Oct",
        time::Month::November => "Nov",
        time::Month::December => "Dec",
    };
    format!(
        "{weekday}, {:02} {month} {} {:02}:{:02}:{:02} GMT",
        now.day(),
        now.year(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Builds the signed handshake URL.
fn handshake_url(base_url: &str, credential: &Credential, now: OffsetDateTime) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let host = base
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let date = http_date(now);
    let signature_origin = format!("host: {host}\ndate: {date}\nGET {CHAT_PATH} HTTP/1.1");

    let mut mac = Hmac::<Sha256>::new_from_slice(credential.api_secret.as_bytes()).map_err(
        |_| RelayError::AuthConfig {
            provider: "spark",
            message: "apiSecret is not usable as an hmac key".to_string(),
        },
    )?;
    mac.update(signature_origin.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{signature}\"",
        credential.api_key
    );
    let authorization = STANDARD.encode(authorization_origin);

    Ok(format!(
        "{base}{CHAT_PATH}?authorization={}&date={}&host={}",
        percent_encode(&authorization),
        percent_encode(&date),
        percent_encode(&host),
    ))
}

#[derive(Debug, Serialize)]
struct SparkRequest {
    header: SparkRequestHeader,
    parameter: SparkParameter,
    payload: SparkRequestPayload,
}

#[derive(Debug, Serialize)]
struct SparkRequestHeader {
    app_id: String,
}

#[derive(Debug, Serialize)]
struct SparkParameter {
    chat: SparkChatParameter,
}

#[derive(Debug, Serialize)]
struct SparkChatParameter {
    domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SparkRequestPayload {
    message: SparkMessagePayload,
}

#[derive(Debug, Serialize)]
struct SparkMessagePayload {
    text: Vec<SparkMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SparkMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct SparkFrame {
    header: SparkFrameHeader,
    #[serde(default)]
    payload: Option<SparkFramePayload>,
}

#[derive(Debug, Deserialize)]
struct SparkFrameHeader {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: i32,
}

#[derive(Debug, Deserialize)]
struct SparkFramePayload {
    #[serde(default)]
    choices: Option<SparkChoices>,
    #[serde(default)]
    usage: Option<SparkUsage>,
}

#[derive(Debug, Deserialize)]
struct SparkChoices {
    #[serde(default)]
    text: Vec<SparkMessage>,
}

#[derive(Debug, Deserialize)]
struct SparkUsage {
    #[serde(default)]
    text: Option<Usage>,
}

fn native_request(credential: &Credential, req: &GeneralRequest) -> SparkRequest {
    SparkRequest {
        header: SparkRequestHeader {
            app_id: credential.app_id.clone(),
        },
        parameter: SparkParameter {
            chat: SparkChatParameter {
                domain: DOMAIN.to_string(),
                temperature: req.temperature,
                max_tokens: req.max_tokens,
            },
        },
        payload: SparkRequestPayload {
            message: SparkMessagePayload {
                text: req
                    .messages
                    .iter()
                    .map(|m| SparkMessage {
                        role: if m.role == "assistant" {
                            "assistant".to_string()
                        } else {
                            "user".to_string()
                        },
                        content: m.content.clone(),
                    })
                    .collect(),
            },
        },
    }
}

/// Runs the whole exchange over the websocket. For streamed relays the sink
/// receives canonical chunks as frames arrive; the collected answer and
/// usage come back either way.
pub async fn relay(
    ctx: &ChannelContext,
    req: &GeneralRequest,
    model: &str,
    sink: Option<&StreamSink>,
    prompt_tokens: u32,
) -> Result<(String, Usage)> {
    let credential = parse_credential(&ctx.key)?;
    let url = handshake_url(&ctx.base_url, &credential, OffsetDateTime::now_utc())?;

    let (mut ws, _) = connect_async(&url)
        .await
        .map_err(|e| RelayError::internal("websocket_connect_failed", e.to_string()))?;

    let outbound = serde_json::to_string(&native_request(&credential, req))
        .map_err(|e| RelayError::internal("marshal_request_failed", e.to_string()))?;
    ws.send(Message::Text(outbound))
        .await
        .map_err(|e| RelayError::internal("websocket_send_failed", e.to_string()))?;

    let mut collected = String::new();
    let mut usage: Option<Usage> = None;
    let mut caller_gone = false;

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| RelayError::internal("websocket_read_failed", e.to_string()))?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed: SparkFrame = serde_json::from_str(&text)
            .map_err(|e| RelayError::internal("unmarshal_response_failed", e.to_string()))?;
        if parsed.header.code != 0 {
            return Err(RelayError::Upstream {
                status: 500,
                error: ErrorBody {
                    message: parsed.header.message,
                    kind: "spark_error".to_string(),
                    param: None,
                    code: serde_json::json!(parsed.header.code),
                },
            });
        }
        let finished = parsed.header.status == 2;
        if let Some(payload) = parsed.payload {
            if let Some(choices) = payload.choices {
                for piece in &choices.text {
                    collected.push_str(&piece.content);
                    if let Some(sink) = sink {
                        let mut chunk = StreamChunk::content(model, piece.content.clone());
                        if finished {
                            chunk.choices[0].finish_reason = Some("stop".to_string());
                        }
                        if !sink.send_json(&chunk).await {
                            caller_gone = true;
                            break;
                        }
                    }
                }
            }
            if let Some(u) = payload.usage.and_then(|u| u.text) {
                usage = Some(u);
            }
        }
        if finished || caller_gone {
            break;
        }
    }
    let _ = ws.close(None).await;

    let usage = usage
        .unwrap_or_else(|| Usage::new(prompt_tokens, crate::counter::count_text(&collected, model)));
    Ok((collected, usage))
}

pub fn canonical_response(model: &str, content: String, usage: Usage) -> Result<bytes::Bytes> {
    let canonical = ChatResponse::assistant_text(model, content, usage);
    let body = serde_json::to_vec(&canonical)
        .map_err(|e| RelayError::internal("marshal_response_failed", e.to_string()))?;
    Ok(body.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn credential_parsing() {
        let cred = parse_credential("app|secret|key").unwrap();
        assert_eq!(cred.app_id, "app");
        assert!(parse_credential("app|short").is_err());
    }

    #[test]
    fn date_is_rfc1123_gmt() {
        let date = http_date(datetime!(2023-07-04 09:05:03 UTC));
        assert_eq!(date, "Tue, 04 Jul 2023 09:05:03 GMT");
    }

    #[test]
    fn handshake_url_carries_signature_params() {
        let cred = parse_credential("app|secret|key").unwrap();
        let url = handshake_url(
            "wss://spark-api.xf-yun.com",
            &cred,
            datetime!(2023-07-04 09:05:03 UTC),
        )
        .unwrap();
        assert!(url.starts_with("wss://spark-api.xf-yun.com/v1.1/chat?authorization="));
        assert!(url.contains("&date=Tue%2C%2004%20Jul%202023"));
        assert!(url.ends_with("&host=spark-api.xf-yun.com"));
    }

    #[test]
    fn native_request_shape() {
        let cred = parse_credential("app|secret|key").unwrap();
        let req = GeneralRequest {
            model: "SparkDesk".into(),
            messages: vec![crate::schema::ChatMessage::new("system", "be brief")],
            ..Default::default()
        };
        let native = native_request(&cred, &req);
        let json = serde_json::to_value(&native).unwrap();
        assert_eq!(json["header"]["app_id"], "app");
        assert_eq!(json["parameter"]["chat"]["domain"], "general");
        // system turns are folded into user role
        assert_eq!(json["payload"]["message"]["text"][0]["role"], "user");
    }
}
