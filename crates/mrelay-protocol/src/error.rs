use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The OpenAI-style error envelope every relay endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, kind: impl Into<String>, code: Option<String>) -> Self {
        Self {
            error: ErrorPayload {
                message: message.into(),
                kind: kind.into(),
                code,
            },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from_static(
                br#"{"error":{"message":"internal error","type":"internal_error"}}"#,
            ),
        }
    }
}
