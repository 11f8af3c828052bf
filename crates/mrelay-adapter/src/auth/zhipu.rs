use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::auth::TokenCache;
use crate::error::{AdapterError, AdapterResult};

const TOKEN_TTL: Duration = Duration::from_secs(300);

fn token_cache() -> &'static TokenCache {
    static CACHE: OnceLock<TokenCache> = OnceLock::new();
    CACHE.get_or_init(TokenCache::new)
}

/// GLM auth mints a short-lived JWT from an `id.secret` API key. The header
/// carries the non-standard `sign_type` field, so the token is assembled by
/// hand rather than through a JWT library.
pub async fn bearer_token(api_key: &str) -> AdapterResult<String> {
    let cache_key = format!("zhipu:{api_key}");
    let api_key = api_key.to_string();
    token_cache()
        .get_or_refresh(&cache_key, || async move {
            let token = mint(&api_key, SystemTime::now())?;
            Ok((token, TOKEN_TTL))
        })
        .await
}

pub fn mint(api_key: &str, now: SystemTime) -> AdapterResult<String> {
    let (id, secret) = api_key
        .split_once('.')
        .ok_or_else(|| AdapterError::InvalidConfig("zhipu key must be id.secret".to_string()))?;

    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let header = r#"{"alg":"HS256","sign_type":"SIGN"}"#;
    let payload = format!(
        r#"{{"api_key":"{id}","exp":{},"timestamp":{now_ms}}}"#,
        now_ms + TOKEN_TTL.as_millis() as u64,
    );

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(&payload),
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| AdapterError::InvalidConfig(err.to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_produces_three_segments() {
        let token = mint("abc123.topsecret", UNIX_EPOCH + Duration::from_secs(1_700_000_000))
            .unwrap();
        let segments: Vec<&str> = token.split('.').collect();
        assert_eq!(segments.len(), 3);

        let header = URL_SAFE_NO_PAD.decode(segments[0]).unwrap();
        let header: serde_json::Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["sign_type"], "SIGN");

        let payload = URL_SAFE_NO_PAD.decode(segments[1]).unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(payload["api_key"], "abc123");
    }

    #[test]
    fn mint_is_deterministic_for_fixed_time() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(mint("a.b", at).unwrap(), mint("a.b", at).unwrap());
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(mint("no-dot-here", SystemTime::now()).is_err());
    }
}
