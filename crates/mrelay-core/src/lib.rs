//! The relay pipeline: auth, channel selection, retry, billing, and the
//! background workers that keep the in-memory indexes and async tasks moving.

pub mod ability;
pub mod bootstrap;
pub mod error;
pub mod files;
pub mod ledger;
pub mod limit;
pub mod pipeline;
pub mod price;
pub mod taskpoll;

pub use ability::AbilityCache;
pub use bootstrap::{Bootstrap, bootstrap, spawn_cache_refresher};
pub use error::{RelayError, RelayErrorKind, classify_adapter_error};
pub use files::{FileInput, UploadedFile};
pub use ledger::Ledger;
pub use limit::Limits;
pub use pipeline::{Caller, GuardedStream, PipelineConfig, RelayOutcome, RelayPipeline};
pub use price::{PriceTable, Ratios, actual_quota, pre_consume_quota};
pub use taskpoll::TaskPoller;
