//! Target registry — supported chat systems and their tab URL patterns.

use serde::{Deserialize, Serialize};

/// Supported chat systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Claude,
    ChatGpt,
    Gemini,
    DeepSeek,
    Qwen,
    Kimi,
    Doubao,
    ChatGlm,
}

impl Target {
    pub fn all() -> &'static [Target] {
        &[
            Self::Claude,
            Self::ChatGpt,
            Self::Gemini,
            Self::DeepSeek,
            Self::Qwen,
            Self::Kimi,
            Self::Doubao,
            Self::ChatGlm,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::ChatGpt => "chatgpt",
            Self::Gemini => "gemini",
            Self::DeepSeek => "deepseek",
            Self::Qwen => "qwen",
            Self::Kimi => "kimi",
            Self::Doubao => "doubao",
            Self::ChatGlm => "chatglm",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "chatgpt" => Some(Self::ChatGpt),
            "gemini" => Some(Self::Gemini),
            "deepseek" => Some(Self::DeepSeek),
            "qwen" => Some(Self::Qwen),
            "kimi" => Some(Self::Kimi),
            "doubao" => Some(Self::Doubao),
            "chatglm" => Some(Self::ChatGlm),
            _ => None,
        }
    }

    /// URL substrings that identify a live tab for this target.
    pub fn url_patterns(&self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["claude.ai"],
            Self::ChatGpt => &["chat.openai.com", "chatgpt.com"],
            Self::Gemini => &["gemini.google.com"],
            Self::DeepSeek => &["chat.deepseek.com"],
            Self::Qwen => &["chat.qwen.ai", "www.qianwen.com", "qianwen.com"],
            Self::Kimi => &["www.kimi.com", "kimi.com"],
            Self::Doubao => &[
                "www.doubao.com",
                "doubao.com",
                "bot.doubao.com",
                "chat.doubao.com",
            ],
            Self::ChatGlm => &["chatglm.cn"],
        }
    }

    /// Whether a tab URL belongs to this target.
    pub fn matches_url(&self, url: &str) -> bool {
        self.url_patterns().iter().any(|p| url.contains(p))
    }

    /// Identify the target (if any) owning a tab URL.
    pub fn for_url(url: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.matches_url(url))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
