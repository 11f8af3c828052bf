//! Provider abstraction layer: one adapter per provider family, all speaking
//! the relay's canonical shapes at the seam.
//!
//! This crate does no routing and holds no durable state. The pipeline hands
//! each adapter a [`RelayContext`] (selected channel, credential, mapped
//! model) and a [`RelayRequest`]; the adapter owns the provider wire format,
//! its auth side channel, and the stream mapping back to canonical events.

pub mod adapter;
pub mod auth;
pub mod client;
pub mod context;
pub mod count;
pub mod error;
pub mod provider;
pub mod registry;
pub mod request;
pub mod response;
pub mod stream;
pub mod transform;

pub use adapter::Adapter;
pub use context::RelayContext;
pub use error::{AdapterError, AdapterResult};
pub use registry::{AdapterFactory, AdapterRegistry};
pub use request::RelayRequest;
pub use response::{AdapterResponse, StreamHandle, UsageAccumulator};
pub use stream::{StreamMapper, in_band_error, in_band_named_error, relay_stream};
pub use transform::{
    ClaudeStreamAdapter, chat_response_to_claude, claude_request_to_chat,
};
