use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AdapterError, AdapterResult};

/// Spark endpoints authenticate with an HMAC-signed URL: the signature covers
/// `host`, an RFC 1123 `date`, and the request line, keyed by the API secret.
/// Pure function of (credential, request, now).
pub fn assemble_auth_url(
    base_url: &str,
    path: &str,
    api_key: &str,
    api_secret: &str,
    method: &str,
    now: SystemTime,
) -> AdapterResult<String> {
    let host = host_of(base_url)?;
    let date = httpdate::fmt_http_date(now);

    let signature_origin = format!("host: {host}\ndate: {date}\n{method} {path} HTTP/1.1");
    let mut mac = Hmac::<Sha256>::new_from_slice(api_secret.as_bytes())
        .map_err(|err| AdapterError::InvalidConfig(err.to_string()))?;
    mac.update(signature_origin.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{api_key}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{signature}\"",
    );
    let authorization = STANDARD.encode(authorization_origin);

    Ok(format!(
        "{}{}?authorization={}&date={}&host={}",
        base_url.trim_end_matches('/'),
        path,
        urlencoding::encode(&authorization),
        urlencoding::encode(&date),
        urlencoding::encode(&host),
    ))
}

fn host_of(base_url: &str) -> AdapterResult<String> {
    let stripped = base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("wss://")
        .trim_start_matches("ws://");
    let host = stripped.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(AdapterError::InvalidConfig(format!(
            "cannot extract host from {base_url}"
        )));
    }
    Ok(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn auth_url_is_deterministic() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = assemble_auth_url(
            "https://spark-api-open.xf-yun.com",
            "/v1/chat/completions",
            "key",
            "secret",
            "POST",
            at,
        )
        .unwrap();
        let b = assemble_auth_url(
            "https://spark-api-open.xf-yun.com",
            "/v1/chat/completions",
            "key",
            "secret",
            "POST",
            at,
        )
        .unwrap();
        assert_eq!(a, b);
        assert!(a.contains("authorization="));
        assert!(a.contains("host=spark-api-open.xf-yun.com"));
    }

    #[test]
    fn different_secrets_sign_differently() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = assemble_auth_url("https://h.example", "/p", "k", "s1", "GET", at).unwrap();
        let b = assemble_auth_url("https://h.example", "/p", "k", "s2", "GET", at).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn bad_base_url_is_rejected() {
        assert!(assemble_auth_url("https://", "/p", "k", "s", "GET", SystemTime::now()).is_err());
    }
}
