use std::collections::HashMap;

use mrelay_common::ChannelKind;

use crate::adapter::Adapter;
use crate::provider::{
    ali::AliAdapter, anthropic::AnthropicAdapter, aws::AwsAdapter, baidu::BaiduAdapter,
    cloudflare::CloudflareAdapter, cohere::CohereAdapter, gemini::GeminiAdapter,
    midjourney::MidjourneyAdapter, openai::OpenAIAdapter, suno::SunoAdapter,
    xunfei::XunfeiAdapter, zhipu::ZhipuAdapter,
};

pub type AdapterFactory = Box<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

/// Channel kind -> adapter factory. Kinds that speak the OpenAI dialect all
/// resolve to the default adapter; their identity lives in the channel's
/// base URL and credentials.
pub struct AdapterRegistry {
    factories: HashMap<ChannelKind, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(ChannelKind::Anthropic, || Box::new(AnthropicAdapter::new()));
        registry.register(ChannelKind::Gemini, || Box::new(GeminiAdapter::new()));
        registry.register(ChannelKind::Baidu, || Box::new(BaiduAdapter::new()));
        registry.register(ChannelKind::Zhipu, || Box::new(ZhipuAdapter::new()));
        registry.register(ChannelKind::Ali, || Box::new(AliAdapter::new()));
        registry.register(ChannelKind::Xunfei, || Box::new(XunfeiAdapter::new()));
        registry.register(ChannelKind::Aws, || Box::new(AwsAdapter::new()));
        registry.register(ChannelKind::Cohere, || Box::new(CohereAdapter::new()));
        registry.register(ChannelKind::Cloudflare, || {
            Box::new(CloudflareAdapter::new())
        });
        registry.register(ChannelKind::Midjourney, || {
            Box::new(MidjourneyAdapter::new())
        });
        registry.register(ChannelKind::Suno, || Box::new(SunoAdapter::new()));
        registry
    }

    pub fn register<F>(&mut self, kind: ChannelKind, factory: F)
    where
        F: Fn() -> Box<dyn Adapter> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn create(&self, kind: ChannelKind) -> Box<dyn Adapter> {
        match self.factories.get(&kind) {
            Some(factory) => factory(),
            // Everything OpenAI-compatible falls through to the default.
            None => Box::new(OpenAIAdapter::new()),
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_kinds_share_the_default_adapter() {
        let registry = AdapterRegistry::builtin();
        for kind in [
            ChannelKind::OpenAI,
            ChannelKind::Moonshot,
            ChannelKind::DeepSeek,
            ChannelKind::Groq,
            ChannelKind::Ollama,
        ] {
            assert!(kind.is_openai_compatible());
            // Creation must succeed for every kind, registered or not.
            let _ = registry.create(kind);
        }
    }
}
