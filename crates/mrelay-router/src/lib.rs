//! HTTP edge: binds the canonical relay surface to the pipeline.

mod relay;

pub use relay::relay_router;
