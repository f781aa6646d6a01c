//! Pricing tables: model ratio, group ratio and completion ratio, plus the
//! model-owner table the sync layer keeps consistent with channel reloads.
//! All tables are hot-reloadable; readers take the cheap read lock.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Default model ratio for models with no explicit entry.
const DEFAULT_MODEL_RATIO: f64 = 30.0;

pub struct Pricing {
    model_ratio: RwLock<HashMap<String, f64>>,
    group_ratio: RwLock<HashMap<String, f64>>,
    completion_ratio: RwLock<HashMap<String, f64>>,
    model_owner: RwLock<HashMap<String, String>>,
}

impl Pricing {
    pub fn new() -> Self {
        Self {
            model_ratio: RwLock::new(default_model_ratios()),
            group_ratio: RwLock::new(HashMap::from([
                ("default".to_string(), 1.0),
                ("vip".to_string(), 1.0),
                ("svip".to_string(), 1.0),
            ])),
            completion_ratio: RwLock::new(HashMap::new()),
            model_owner: RwLock::new(default_model_owners()),
        }
    }

    pub async fn model_ratio(&self, model: &str) -> f64 {
        self.model_ratio
            .read()
            .await
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_MODEL_RATIO)
    }

    pub async fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.read().await.get(group).copied().unwrap_or(1.0)
    }

    /// Multiplier applied to completion tokens only.
    pub async fn completion_ratio(&self, model: &str) -> f64 {
        if let Some(r) = self.completion_ratio.read().await.get(model) {
            return *r;
        }
        if model.starts_with("gpt-3.5") {
            4.0 / 3.0
        } else if model.starts_with("gpt-4-32k") {
            2.0
        } else if model.starts_with("gpt-4") {
            2.0
        } else if model.starts_with("claude") {
            3.0
        } else {
            1.0
        }
    }

    pub async fn owner_of(&self, model: &str) -> Option<String> {
        self.model_owner.read().await.get(model).cloned()
    }

    pub async fn replace_model_ratios(&self, ratios: HashMap<String, f64>) {
        *self.model_ratio.write().await = ratios;
    }

    pub async fn replace_group_ratios(&self, ratios: HashMap<String, f64>) {
        *self.group_ratio.write().await = ratios;
    }

    pub async fn replace_completion_ratios(&self, ratios: HashMap<String, f64>) {
        *self.completion_ratio.write().await = ratios;
    }

    pub async fn replace_model_owners(&self, owners: HashMap<String, String>) {
        *self.model_owner.write().await = owners;
    }

    /// Reload from an options blob, e.g. published through `options_sync`.
    /// Unknown keys are ignored; a malformed table leaves the current one
    /// untouched.
    pub async fn reload_from_options(&self, options: &HashMap<String, String>) {
        if let Some(raw) = options.get("ModelRatio") {
            if let Ok(parsed) = serde_json::from_str::<HashMap<String, f64>>(raw) {
                self.replace_model_ratios(parsed).await;
            }
        }
        if let Some(raw) = options.get("GroupRatio") {
            if let Ok(parsed) = serde_json::from_str::<HashMap<String, f64>>(raw) {
                self.replace_group_ratios(parsed).await;
            }
        }
        if let Some(raw) = options.get("CompletionRatio") {
            if let Ok(parsed) = serde_json::from_str::<HashMap<String, f64>>(raw) {
                self.replace_completion_ratios(parsed).await;
            }
        }
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self::new()
    }
}

fn default_model_ratios() -> HashMap<String, f64> {
    let table: &[(&str, f64)] = &[
        ("gpt-3.5-turbo", 0.75),
        ("gpt-3.5-turbo-0301", 0.75),
        ("gpt-3.5-turbo-0613", 0.75),
        ("gpt-3.5-turbo-16k", 1.5),
        ("gpt-4", 15.0),
        ("gpt-4-0314", 15.0),
        ("gpt-4-0613", 15.0),
        ("gpt-4-32k", 30.0),
        ("text-embedding-ada-002", 0.05),
        ("text-davinci-003", 10.0),
        ("text-moderation-latest", 0.1),
        ("text-moderation-stable", 0.1),
        ("claude-instant-1", 0.4),
        ("claude-2", 4.0),
        ("chat-bison-001", 1.0),
        ("ERNIE-Bot", 0.4293),
        ("ERNIE-Bot-turbo", 0.2858),
        ("ERNIE-Bot-4", 8.572),
        ("Embedding-V1", 0.1429),
        ("chatglm_pro", 0.7143),
        ("chatglm_std", 0.3572),
        ("chatglm_lite", 0.1429),
        ("qwen-turbo", 0.5715),
        ("qwen-plus", 1.4286),
        ("text-embedding-v1", 0.05),
        ("SparkDesk", 1.2858),
        ("ChatStd", 1.0),
        ("ChatPro", 10.0),
    ];
    table
        .iter()
        .map(|(name, ratio)| (name.to_string(), *ratio))
        .collect()
}

fn default_model_owners() -> HashMap<String, String> {
    let table: &[(&str, &str)] = &[
        ("gpt-3.5-turbo", "OpenAI"),
        ("gpt-4", "OpenAI"),
        ("text-embedding-ada-002", "OpenAI"),
        ("claude-instant-1", "Anthropic"),
        ("claude-2", "Anthropic"),
        ("chat-bison-001", "Google"),
        ("ERNIE-Bot", "Baidu"),
        ("chatglm_pro", "Zhipu"),
        ("qwen-turbo", "Alibaba"),
        ("SparkDesk", "Xunfei"),
        ("ChatPro", "Tencent"),
    ];
    table
        .iter()
        .map(|(model, owner)| (model.to_string(), owner.to_string()))
        .collect()
}
