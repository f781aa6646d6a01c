//! Approximate token counting for billing and preconsume estimates.
//!
//! Counts use tiktoken encodings and must be stable per model; encoders are
//! cached after first use because construction is expensive.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};

use crate::schema::{ChatMessage, GeneralRequest};

static ENCODERS: Lazy<RwLock<HashMap<String, Arc<CoreBPE>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static FALLBACK: Lazy<Arc<CoreBPE>> = Lazy::new(|| {
    Arc::new(cl100k_base().expect("cl100k_base encoding tables are embedded"))
});

fn encoder_for(model: &str) -> Arc<CoreBPE> {
    if let Some(enc) = ENCODERS.read().expect("encoder cache poisoned").get(model) {
        return enc.clone();
    }
    let enc = match get_bpe_from_model(model) {
        Ok(bpe) => Arc::new(bpe),
        Err(_) => FALLBACK.clone(),
    };
    ENCODERS
        .write()
        .expect("encoder cache poisoned")
        .insert(model.to_string(), enc.clone());
    enc
}

pub fn count_text(text: &str, model: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    encoder_for(model).encode_with_special_tokens(text).len() as u32
}

/// Chat counting with per-message framing overhead: each message costs
/// 3 tokens of scaffolding plus 1 when a name is present, and the reply is
/// primed with 3 more.
pub fn count_messages(messages: &[ChatMessage], model: &str) -> u32 {
    const TOKENS_PER_MESSAGE: u32 = 3;
    const TOKENS_PER_NAME: u32 = 1;
    const REPLY_PRIMING: u32 = 3;

    let mut total = REPLY_PRIMING;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += count_text(&message.role, model);
        total += count_text(&message.content, model);
        if message.name.is_some() {
            total += TOKENS_PER_NAME;
        }
    }
    total
}

/// Counts `input` for embeddings/moderations: a string or an array of
/// strings, summed.
pub fn count_input(input: Option<&serde_json::Value>, model: &str) -> u32 {
    match input {
        Some(serde_json::Value::String(s)) => count_text(s, model),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| count_text(s, model))
            .sum(),
        _ => 0,
    }
}

/// Prompt-side count for a request. Chat messages win when present;
/// otherwise prompt, input and instruction are summed.
pub fn count_prompt(req: &GeneralRequest, model: &str) -> u32 {
    if !req.messages.is_empty() {
        return count_messages(&req.messages, model);
    }
    let mut total = 0;
    total += count_input(req.prompt.as_ref(), model);
    total += count_input(req.input.as_ref(), model);
    if let Some(instruction) = &req.instruction {
        total += count_text(instruction, model);
    }
    total
}
