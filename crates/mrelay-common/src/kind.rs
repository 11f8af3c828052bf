use serde::{Deserialize, Serialize};

/// Provider family a channel talks to. Stored as its string form in the
/// channels table; the adapter registry keys factories off this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Gemini,
    Baidu,
    Zhipu,
    Ali,
    Xunfei,
    Aws,
    Cohere,
    Cloudflare,
    Mistral,
    Moonshot,
    DeepSeek,
    Groq,
    Perplexity,
    OpenRouter,
    Xai,
    Ollama,
    Midjourney,
    Suno,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::OpenAI => "openai",
            ChannelKind::Anthropic => "anthropic",
            ChannelKind::Gemini => "gemini",
            ChannelKind::Baidu => "baidu",
            ChannelKind::Zhipu => "zhipu",
            ChannelKind::Ali => "ali",
            ChannelKind::Xunfei => "xunfei",
            ChannelKind::Aws => "aws",
            ChannelKind::Cohere => "cohere",
            ChannelKind::Cloudflare => "cloudflare",
            ChannelKind::Mistral => "mistral",
            ChannelKind::Moonshot => "moonshot",
            ChannelKind::DeepSeek => "deep_seek",
            ChannelKind::Groq => "groq",
            ChannelKind::Perplexity => "perplexity",
            ChannelKind::OpenRouter => "open_router",
            ChannelKind::Xai => "xai",
            ChannelKind::Ollama => "ollama",
            ChannelKind::Midjourney => "midjourney",
            ChannelKind::Suno => "suno",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ChannelKind::OpenAI),
            "anthropic" => Some(ChannelKind::Anthropic),
            "gemini" => Some(ChannelKind::Gemini),
            "baidu" => Some(ChannelKind::Baidu),
            "zhipu" => Some(ChannelKind::Zhipu),
            "ali" => Some(ChannelKind::Ali),
            "xunfei" => Some(ChannelKind::Xunfei),
            "aws" => Some(ChannelKind::Aws),
            "cohere" => Some(ChannelKind::Cohere),
            "cloudflare" => Some(ChannelKind::Cloudflare),
            "mistral" => Some(ChannelKind::Mistral),
            "moonshot" => Some(ChannelKind::Moonshot),
            "deep_seek" | "deepseek" => Some(ChannelKind::DeepSeek),
            "groq" => Some(ChannelKind::Groq),
            "perplexity" => Some(ChannelKind::Perplexity),
            "open_router" | "openrouter" => Some(ChannelKind::OpenRouter),
            "xai" => Some(ChannelKind::Xai),
            "ollama" => Some(ChannelKind::Ollama),
            "midjourney" => Some(ChannelKind::Midjourney),
            "suno" => Some(ChannelKind::Suno),
            _ => None,
        }
    }

    /// Kinds that speak the OpenAI chat wire format directly; they share one
    /// adapter and differ only in default base URL and credentials.
    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            ChannelKind::OpenAI
                | ChannelKind::Mistral
                | ChannelKind::Moonshot
                | ChannelKind::DeepSeek
                | ChannelKind::Groq
                | ChannelKind::Perplexity
                | ChannelKind::OpenRouter
                | ChannelKind::Xai
                | ChannelKind::Ollama
        )
    }

    /// Kinds whose generations complete through the async task subsystem.
    pub fn is_async_task(&self) -> bool {
        matches!(self, ChannelKind::Midjourney | ChannelKind::Suno)
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ChannelKind::OpenAI => "https://api.openai.com",
            ChannelKind::Anthropic => "https://api.anthropic.com",
            ChannelKind::Gemini => "https://generativelanguage.googleapis.com",
            ChannelKind::Baidu => "https://aip.baidubce.com",
            ChannelKind::Zhipu => "https://open.bigmodel.cn",
            ChannelKind::Ali => "https://dashscope.aliyuncs.com",
            ChannelKind::Xunfei => "https://spark-api-open.xf-yun.com",
            ChannelKind::Aws => "",
            ChannelKind::Cohere => "https://api.cohere.ai",
            ChannelKind::Cloudflare => "https://api.cloudflare.com",
            ChannelKind::Mistral => "https://api.mistral.ai",
            ChannelKind::Moonshot => "https://api.moonshot.cn",
            ChannelKind::DeepSeek => "https://api.deepseek.com",
            ChannelKind::Groq => "https://api.groq.com/openai",
            ChannelKind::Perplexity => "https://api.perplexity.ai",
            ChannelKind::OpenRouter => "https://openrouter.ai/api",
            ChannelKind::Xai => "https://api.x.ai",
            ChannelKind::Ollama => "http://localhost:11434",
            ChannelKind::Midjourney => "",
            ChannelKind::Suno => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelKind;

    #[test]
    fn parse_round_trips_as_str() {
        for kind in [
            ChannelKind::OpenAI,
            ChannelKind::Anthropic,
            ChannelKind::DeepSeek,
            ChannelKind::OpenRouter,
            ChannelKind::Midjourney,
        ] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert_eq!(ChannelKind::parse("palm2-classic"), None);
    }
}
