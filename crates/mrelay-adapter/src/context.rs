use std::time::Duration;

use mrelay_common::ChannelKind;

/// Per-request routing and channel info handed to an adapter.
///
/// Built by the relay pipeline after channel selection: the credential has
/// already been picked from the channel's key list and `upstream_model`
/// carries the channel's model mapping applied to the canonical name.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub trace_id: String,
    pub channel_id: i64,
    pub kind: ChannelKind,
    pub base_url: Option<String>,
    /// Selected credential. Multi-part secrets (Baidu `client_id|secret`,
    /// AWS `ak|sk`, Cloudflare `account_id|token`) stay `|`-joined here and
    /// are split by the owning adapter.
    pub key: String,
    pub canonical_model: String,
    pub upstream_model: String,
    pub is_stream: bool,
    /// Pipeline-side prompt estimate; seeds usage accounting until the
    /// upstream reports real numbers.
    pub prompt_tokens: u32,
    pub proxy: Option<String>,
    pub region: Option<String>,
    pub sdk_mode: bool,
    /// Per-event inactivity budget for streamed responses.
    pub stream_timeout: Duration,
}

impl RelayContext {
    pub fn base_url(&self) -> &str {
        match self.base_url.as_deref() {
            Some(url) if !url.is_empty() => url.trim_end_matches('/'),
            _ => self.kind.default_base_url(),
        }
    }

    /// `a|b` credentials; missing parts come back empty.
    pub fn key_parts(&self) -> (&str, &str) {
        match self.key.split_once('|') {
            Some((a, b)) => (a, b),
            None => (self.key.as_str(), ""),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(kind: ChannelKind, model: &str) -> RelayContext {
    RelayContext {
        trace_id: "trace-test".to_string(),
        channel_id: 1,
        kind,
        base_url: None,
        key: "sk-test".to_string(),
        canonical_model: model.to_string(),
        upstream_model: model.to_string(),
        is_stream: false,
        prompt_tokens: 0,
        proxy: None,
        region: None,
        sdk_mode: false,
        stream_timeout: Duration::from_secs(60),
    }
}
