use bytes::Bytes;

use mrelay_protocol::{mj, openai, suno};

/// The canonical request union the pipeline routes. The Anthropic dialect is
/// normalized into the chat shape at the edge and restored on the way out, so
/// provider adapters only ever see these variants.
#[derive(Debug, Clone)]
pub enum RelayRequest {
    Chat(openai::ChatCompletionRequest),
    Completion(openai::CompletionRequest),
    Embedding(openai::EmbeddingRequest),
    Image(openai::ImageRequest),
    Speech(openai::SpeechRequest),
    /// Multipart audio body, already pulled off the wire.
    Transcription {
        model: String,
        file_name: String,
        data: Bytes,
        /// Translation shares the shape; only the endpoint differs.
        translate: bool,
    },
    Moderation(openai::ModerationRequest),
    MjSubmit {
        action: String,
        body: mj::SubmitRequest,
    },
    MjFetch {
        task_id: String,
    },
    SunoSubmit {
        action: String,
        body: suno::SubmitRequest,
    },
    SunoFetch {
        task_id: String,
    },
}

impl RelayRequest {
    pub fn model(&self) -> Option<&str> {
        match self {
            RelayRequest::Chat(req) => Some(&req.model),
            RelayRequest::Completion(req) => Some(&req.model),
            RelayRequest::Embedding(req) => Some(&req.model),
            RelayRequest::Image(req) => Some(&req.model),
            RelayRequest::Speech(req) => Some(&req.model),
            RelayRequest::Transcription { model, .. } => Some(model),
            RelayRequest::Moderation(req) => req.model.as_deref(),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            RelayRequest::Chat(req) => req.is_stream(),
            RelayRequest::Completion(req) => req.stream.unwrap_or(false),
            _ => false,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            RelayRequest::Chat(_) => "chat",
            RelayRequest::Completion(_) => "completion",
            RelayRequest::Embedding(_) => "embedding",
            RelayRequest::Image(_) => "image",
            RelayRequest::Speech(_) => "speech",
            RelayRequest::Transcription { translate, .. } => {
                if *translate {
                    "audio.translation"
                } else {
                    "audio.transcription"
                }
            }
            RelayRequest::Moderation(_) => "moderation",
            RelayRequest::MjSubmit { .. } => "mj.submit",
            RelayRequest::MjFetch { .. } => "mj.fetch",
            RelayRequest::SunoSubmit { .. } => "suno.submit",
            RelayRequest::SunoFetch { .. } => "suno.fetch",
        }
    }
}
