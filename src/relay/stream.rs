//! Caller-facing stream sink. Response adapters push canonical SSE payloads
//! (the part after `data: `) into the sink; the pipeline turns them into SSE
//! events. Send failure means the caller went away, and adapters use that to
//! abort the upstream read.

use serde::Serialize;
use tokio::sync::mpsc;

pub const DONE_FRAME: &str = "[DONE]";

#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<String>,
}

impl StreamSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Forwards one data payload. Returns false once the caller's side of
    /// the stream is gone.
    pub async fn send_data(&self, data: impl Into<String>) -> bool {
        self.tx.send(data.into()).await.is_ok()
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send_data(json).await,
            Err(_) => false,
        }
    }

    pub async fn send_done(&self) -> bool {
        self.send_data(DONE_FRAME).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_after_receiver_drop() {
        let (sink, rx) = StreamSink::channel(4);
        assert!(sink.send_data("x").await);
        drop(rx);
        assert!(!sink.send_data("y").await);
    }

    #[tokio::test]
    async fn json_payloads_are_serialized() {
        let (sink, mut rx) = StreamSink::channel(4);
        sink.send_json(&serde_json::json!({"a": 1})).await;
        assert_eq!(rx.recv().await.unwrap(), r#"{"a":1}"#);
    }
}
