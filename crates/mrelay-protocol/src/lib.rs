//! Canonical wire shapes spoken at the relay edge.
//!
//! The gateway's neutral dialect is the OpenAI one; Anthropic, Midjourney and
//! Suno dialects are parsed here and transformed at the adapter layer. These
//! types stay tolerant on purpose: unknown provider parameters ride through in
//! `extra` maps instead of being dropped.

pub mod claude;
pub mod error;
pub mod mj;
pub mod openai;
pub mod sse;
pub mod suno;

pub use error::{ErrorEnvelope, ErrorPayload};
pub use openai::Usage;
