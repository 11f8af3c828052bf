use std::time::{SystemTime, UNIX_EPOCH};

pub mod ali;
pub mod anthropic;
pub mod aws;
pub mod baidu;
pub mod cloudflare;
pub mod cohere;
pub mod gemini;
pub mod midjourney;
pub mod openai;
pub mod suno;
pub mod xunfei;
pub mod zhipu;

pub(crate) fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
