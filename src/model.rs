//! Domain types shared across the relay: users, tokens, channels and the
//! derived routing metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type TokenId = i64;
pub type ChannelId = i64;

/// Upstream provider family. This is the switch key for the translator set;
/// Azure shares the OpenAI wire shape but carries its own URL/auth rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Azure,
    AnthropicClaude,
    GooglePalm,
    BaiduErnie,
    Zhipu,
    AlibabaDashScope,
    XunfeiSpark,
    AiProxyLibrary,
    TencentHunyuan,
    OpenAiWeb,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::AnthropicClaude => "claude",
            Self::GooglePalm => "palm",
            Self::BaiduErnie => "ernie",
            Self::Zhipu => "zhipu",
            Self::AlibabaDashScope => "dashscope",
            Self::XunfeiSpark => "spark",
            Self::AiProxyLibrary => "aiproxy",
            Self::TencentHunyuan => "hunyuan",
            Self::OpenAiWeb => "openai_web",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi | Self::Azure => "https://api.openai.com",
            Self::AnthropicClaude => "https://api.anthropic.com",
            Self::GooglePalm => "https://generativelanguage.googleapis.com",
            Self::BaiduErnie => "https://aip.baidubce.com",
            Self::Zhipu => "https://open.bigmodel.cn",
            Self::AlibabaDashScope => "https://dashscope.aliyuncs.com",
            Self::XunfeiSpark => "wss://spark-api.xf-yun.com",
            Self::AiProxyLibrary => "https://api.aiproxy.io",
            Self::TencentHunyuan => "https://hunyuan.cloud.tencent.com",
            Self::OpenAiWeb => "https://chat.openai.com",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    AutoDisabled,
    ManuallyDisabled,
}

/// A configured upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub kind: ProviderKind,
    /// Provider credential. Composite for some vendors, e.g. Tencent's
    /// `appId|secretId|secretKey` or Zhipu's `id.secret`.
    pub key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub status: ChannelStatus,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub priority: i32,
    /// How many concurrent upstream attempts to race. Always >= 1.
    #[serde(default = "default_fanout")]
    pub async_fanout: u32,
    /// Rewrites the canonical model name before translation. Pricing keeps
    /// using the original name.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Comma-separated in the admin surface; parsed once on load.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Azure `api-version`, or other per-channel URL template parameter.
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub used_quota: i64,
}

fn default_fanout() -> u32 {
    1
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn supports(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }

    /// Maps the canonical model name through the channel's model mapping.
    pub fn map_model(&self, model: &str) -> String {
        match self.model_mapping.get(model) {
            Some(mapped) if !mapped.is_empty() => mapped.clone(),
            _ => model.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

/// Issued caller credential, owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub user_id: UserId,
    pub name: String,
    pub key: String,
    pub status: TokenStatus,
    pub remaining_quota: i64,
    #[serde(default)]
    pub unlimited_quota: bool,
    /// Unix seconds; `None` never expires.
    #[serde(default)]
    pub expired_at: Option<i64>,
}

impl Token {
    pub fn is_usable(&self, now_unix: i64) -> std::result::Result<(), TokenStatus> {
        match self.status {
            TokenStatus::Enabled => {}
            other => return Err(other),
        }
        if let Some(expiry) = self.expired_at {
            if expiry <= now_unix {
                return Err(TokenStatus::Expired);
            }
        }
        if !self.unlimited_quota && self.remaining_quota <= 0 {
            return Err(TokenStatus::Exhausted);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Pricing tier; multiplies the effective cost ratio.
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    /// Admins may pin calls to a channel and override URLs per call.
    #[serde(default)]
    pub is_admin: bool,
}

/// Which caller-facing operation a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
    ImageGenerations,
    AudioTranscription,
    AudioTts,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Option<Self> {
        if path.starts_with("/v1/chat/completions") {
            Some(Self::ChatCompletions)
        } else if path.starts_with("/v1/completions") {
            Some(Self::Completions)
        } else if path.starts_with("/v1/embeddings") || path.contains("/embeddings") {
            Some(Self::Embeddings)
        } else if path.starts_with("/v1/moderations") {
            Some(Self::Moderations)
        } else if path.starts_with("/v1/edits") {
            Some(Self::Edits)
        } else if path.starts_with("/v1/images/generations") {
            Some(Self::ImageGenerations)
        } else if path.starts_with("/v1/audio/transcriptions") {
            Some(Self::AudioTranscription)
        } else if path.starts_with("/v1/audio/speech") {
            Some(Self::AudioTts)
        } else {
            None
        }
    }

    pub fn task_path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat/completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::Edits => "edits",
            Self::ImageGenerations => "images/generations",
            Self::AudioTranscription => "audio/transcriptions",
            Self::AudioTts => "audio/speech",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::Edits => "edits",
            Self::ImageGenerations => "image_generations",
            Self::AudioTranscription => "audio_transcription",
            Self::AudioTts => "audio_tts",
        }
    }
}

/// One settled relay call, persisted for reconciliation and billing audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub user_id: UserId,
    pub token_id: TokenId,
    pub token_name: String,
    pub channel_id: ChannelId,
    pub mode: RelayMode,
    pub model: String,
    pub stream: bool,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub quota: i64,
    /// Free text; carries the literal ratio values used for this call.
    pub content: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        Token {
            id: 1,
            user_id: 1,
            name: "t".into(),
            key: "abc".into(),
            status: TokenStatus::Enabled,
            remaining_quota: 100,
            unlimited_quota: false,
            expired_at: None,
        }
    }

    #[test]
    fn token_expiry_and_exhaustion() {
        let mut t = token();
        assert!(t.is_usable(0).is_ok());

        t.expired_at = Some(10);
        assert_eq!(t.is_usable(10), Err(TokenStatus::Expired));

        t.expired_at = None;
        t.remaining_quota = 0;
        assert_eq!(t.is_usable(0), Err(TokenStatus::Exhausted));

        t.unlimited_quota = true;
        assert!(t.is_usable(0).is_ok());
    }

    #[test]
    fn model_mapping_falls_through() {
        let mut ch = Channel {
            id: 1,
            name: "c".into(),
            kind: ProviderKind::OpenAi,
            key: "k".into(),
            base_url: None,
            status: ChannelStatus::Enabled,
            weight: 1,
            priority: 0,
            async_fanout: 1,
            model_mapping: HashMap::new(),
            models: vec!["gpt-3.5-turbo".into()],
            groups: vec!["default".into()],
            api_version: None,
            used_quota: 0,
        };
        assert_eq!(ch.map_model("gpt-3.5-turbo"), "gpt-3.5-turbo");
        ch.model_mapping
            .insert("gpt-3.5-turbo".into(), "gpt-35".into());
        assert_eq!(ch.map_model("gpt-3.5-turbo"), "gpt-35");
    }

    #[test]
    fn relay_mode_from_path() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions"),
            Some(RelayMode::ChatCompletions)
        );
        assert_eq!(
            RelayMode::from_path("/v1/engines/text-embedding-ada-002/embeddings"),
            Some(RelayMode::Embeddings)
        );
        assert_eq!(RelayMode::from_path("/v1/unknown"), None);
    }
}
