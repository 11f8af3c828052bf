use bytes::Bytes;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream network error: {0}")]
    Network(String),
    /// Non-2xx upstream answer, body passed through for classification.
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: Bytes },
    #[error("upstream response parse error: {0}")]
    Parse(String),
}

impl AdapterError {
    pub fn upstream(status: u16, body: impl Into<Bytes>) -> Self {
        AdapterError::Upstream {
            status,
            body: body.into(),
        }
    }

    pub fn upstream_body_text(&self) -> Option<String> {
        match self {
            AdapterError::Upstream { body, .. } => {
                Some(String::from_utf8_lossy(body).to_string())
            }
            _ => None,
        }
    }
}
