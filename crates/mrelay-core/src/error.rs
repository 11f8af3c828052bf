use bytes::Bytes;
use http::StatusCode;

use mrelay_adapter::AdapterError;
use mrelay_protocol::ErrorEnvelope;
use mrelay_storage::StatusCodeMapping;

/// Error taxonomy of the relay pipeline. Every failure carries a kind plus a
/// user-visible message; upstream bodies ride along for passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    NoAvailableChannel,
    RateLimited,
    UpstreamTransient,
    UpstreamFatal,
    UpstreamAuthDead,
    StreamAborted,
    InternalError,
}

impl RelayErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RelayErrorKind::UpstreamTransient | RelayErrorKind::UpstreamAuthDead
        )
    }

    pub fn disables_channel(&self) -> bool {
        matches!(self, RelayErrorKind::UpstreamAuthDead)
    }

    pub fn wire_type(&self) -> &'static str {
        match self {
            RelayErrorKind::InvalidRequest => "invalid_request_error",
            RelayErrorKind::Unauthorized => "authentication_error",
            RelayErrorKind::Forbidden => "permission_error",
            RelayErrorKind::QuotaExceeded => "insufficient_quota",
            RelayErrorKind::NoAvailableChannel => "no_available_channel",
            RelayErrorKind::RateLimited => "rate_limit_error",
            RelayErrorKind::UpstreamTransient | RelayErrorKind::UpstreamFatal => "upstream_error",
            RelayErrorKind::UpstreamAuthDead => "upstream_auth_error",
            RelayErrorKind::StreamAborted => "stream_aborted",
            RelayErrorKind::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
    /// Upstream answer for passthrough, when one exists.
    pub upstream_status: Option<u16>,
    pub upstream_body: Option<Bytes>,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.wire_type(), self.message)
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
            upstream_body: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Forbidden, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::QuotaExceeded, message)
    }

    pub fn no_channel(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::NoAvailableChannel, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::RateLimited, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::InternalError, message)
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            RelayErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            RelayErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayErrorKind::Forbidden => StatusCode::FORBIDDEN,
            RelayErrorKind::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            RelayErrorKind::NoAvailableChannel => StatusCode::SERVICE_UNAVAILABLE,
            RelayErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayErrorKind::UpstreamTransient
            | RelayErrorKind::UpstreamFatal
            | RelayErrorKind::UpstreamAuthDead => self
                .upstream_status
                .and_then(|status| StatusCode::from_u16(status).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            RelayErrorKind::StreamAborted => StatusCode::BAD_GATEWAY,
            RelayErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(
            self.message.clone(),
            self.kind.wire_type(),
            self.upstream_status.map(|status| status.to_string()),
        )
    }

    pub fn body(&self) -> Bytes {
        // Upstream 4xx bodies pass through verbatim when present.
        match (&self.upstream_body, self.kind) {
            (Some(body), RelayErrorKind::UpstreamFatal) if !body.is_empty() => body.clone(),
            _ => self.envelope().to_bytes(),
        }
    }
}

impl From<mrelay_storage::StoreError> for RelayError {
    fn from(err: mrelay_storage::StoreError) -> Self {
        match err {
            mrelay_storage::StoreError::QuotaExceeded => {
                RelayError::quota_exceeded("user quota is not enough")
            }
            other => RelayError::internal(other.to_string()),
        }
    }
}

/// Upstream error body fragments that indicate a dead credential rather than
/// a transient failure.
const AUTH_DEAD_SIGNATURES: &[&str] = &[
    "invalid_api_key",
    "api key not valid",
    "account_deactivated",
    "permission_denied",
    "organization has been disabled",
    "credit",
    "billing",
    "revoked",
];

/// Classify an adapter failure against the channel's status code mapping.
/// Defaults: 429 and 5xx retry on another channel; 401/402, or 403 with an
/// auth-dead body signature, kill the credential.
pub fn classify_adapter_error(
    err: &AdapterError,
    mapping: Option<&StatusCodeMapping>,
) -> RelayError {
    match err {
        AdapterError::InvalidConfig(message) => RelayError {
            kind: RelayErrorKind::UpstreamAuthDead,
            message: message.clone(),
            upstream_status: None,
            upstream_body: None,
        },
        AdapterError::InvalidRequest(message) => RelayError::invalid_request(message.clone()),
        AdapterError::Network(message) => RelayError {
            kind: RelayErrorKind::UpstreamTransient,
            message: message.clone(),
            upstream_status: None,
            upstream_body: None,
        },
        AdapterError::Parse(message) => RelayError {
            kind: RelayErrorKind::UpstreamTransient,
            message: format!("upstream response unreadable: {message}"),
            upstream_status: None,
            upstream_body: None,
        },
        AdapterError::Upstream { status, body } => {
            let kind = classify_status(*status, body, mapping);
            RelayError {
                kind,
                message: format!("upstream returned {status}"),
                upstream_status: Some(*status),
                upstream_body: Some(body.clone()),
            }
        }
    }
}

fn classify_status(status: u16, body: &Bytes, mapping: Option<&StatusCodeMapping>) -> RelayErrorKind {
    if let Some(mapping) = mapping {
        if mapping.disable.contains(&status) {
            return RelayErrorKind::UpstreamAuthDead;
        }
        if mapping.retry.contains(&status) {
            return RelayErrorKind::UpstreamTransient;
        }
    }

    match status {
        429 | 500..=599 => RelayErrorKind::UpstreamTransient,
        401 | 402 => RelayErrorKind::UpstreamAuthDead,
        403 => {
            let text = String::from_utf8_lossy(body).to_ascii_lowercase();
            if AUTH_DEAD_SIGNATURES.iter().any(|sig| text.contains(sig)) {
                RelayErrorKind::UpstreamAuthDead
            } else {
                RelayErrorKind::UpstreamFatal
            }
        }
        _ => RelayErrorKind::UpstreamFatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification() {
        let err = AdapterError::upstream(503, "overloaded");
        assert_eq!(
            classify_adapter_error(&err, None).kind,
            RelayErrorKind::UpstreamTransient
        );

        let err = AdapterError::upstream(401, r#"{"error":{"message":"bad key"}}"#);
        assert_eq!(
            classify_adapter_error(&err, None).kind,
            RelayErrorKind::UpstreamAuthDead
        );

        let err = AdapterError::upstream(400, "bad request");
        assert_eq!(
            classify_adapter_error(&err, None).kind,
            RelayErrorKind::UpstreamFatal
        );
    }

    #[test]
    fn forbidden_needs_a_dead_signature() {
        let plain = AdapterError::upstream(403, "model not allowed in region");
        assert_eq!(
            classify_adapter_error(&plain, None).kind,
            RelayErrorKind::UpstreamFatal
        );
        let dead = AdapterError::upstream(403, r#"{"error":"API key revoked"}"#);
        assert_eq!(
            classify_adapter_error(&dead, None).kind,
            RelayErrorKind::UpstreamAuthDead
        );
    }

    #[test]
    fn channel_mapping_overrides_defaults() {
        let mapping = StatusCodeMapping {
            retry: vec![400],
            disable: vec![503],
        };
        let err = AdapterError::upstream(400, "");
        assert_eq!(
            classify_adapter_error(&err, Some(&mapping)).kind,
            RelayErrorKind::UpstreamTransient
        );
        let err = AdapterError::upstream(503, "");
        assert_eq!(
            classify_adapter_error(&err, Some(&mapping)).kind,
            RelayErrorKind::UpstreamAuthDead
        );
    }

    #[test]
    fn fatal_upstream_body_passes_through() {
        let err = AdapterError::upstream(400, r#"{"error":{"message":"bad size"}}"#);
        let relay = classify_adapter_error(&err, None);
        assert_eq!(relay.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(&relay.body()[..], br#"{"error":{"message":"bad size"}}"#);
    }
}
