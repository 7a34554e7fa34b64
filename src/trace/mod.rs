//! Span recording for a single task run.

pub mod recorder;

pub use recorder::{SpanFinish, SpanRequest, SpanTracer, SpanUpdate, canonical_detail};
