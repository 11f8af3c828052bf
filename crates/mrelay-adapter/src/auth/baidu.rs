use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;

use crate::auth::TokenCache;
use crate::client::shared_client;
use crate::error::{AdapterError, AdapterResult};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

fn token_cache() -> &'static TokenCache {
    static CACHE: OnceLock<TokenCache> = OnceLock::new();
    CACHE.get_or_init(TokenCache::new)
}

/// ERNIE uses OAuth2 client-credentials: the channel key is
/// `client_id|client_secret`, exchanged for a ~30-day access token appended
/// to every request URL.
pub async fn access_token(
    base_url: &str,
    client_id: &str,
    client_secret: &str,
    proxy: Option<&str>,
) -> AdapterResult<String> {
    let cache_key = format!("baidu:{client_id}");
    let url = format!(
        "{}/oauth/2.0/token?grant_type=client_credentials&client_id={}&client_secret={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(client_id),
        urlencoding::encode(client_secret),
    );
    let proxy = proxy.map(|value| value.to_string());

    token_cache()
        .get_or_refresh(&cache_key, || async move {
            let client = shared_client(proxy.as_deref())?;
            let response = client
                .post(&url)
                .send()
                .await
                .map_err(|err| AdapterError::Network(err.to_string()))?;
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|err| AdapterError::Network(err.to_string()))?;
            if !status.is_success() {
                return Err(AdapterError::upstream(status.as_u16(), body));
            }
            let parsed: TokenResponse = serde_json::from_slice(&body)
                .map_err(|err| AdapterError::Parse(err.to_string()))?;
            if let Some(error) = parsed.error {
                let description = parsed.error_description.unwrap_or_default();
                return Err(AdapterError::InvalidConfig(format!(
                    "baidu oauth rejected: {error} {description}"
                )));
            }
            let token = parsed
                .access_token
                .ok_or_else(|| AdapterError::Parse("missing access_token".to_string()))?;
            let ttl = Duration::from_secs(parsed.expires_in.unwrap_or(2_592_000));
            Ok((token, ttl))
        })
        .await
}
