//! Engine tracing: spans and events on a process-wide bus.
//!
//! Distinct from the `tracing` crate's diagnostics: these records are data,
//! kept in a ring buffer and streamed live to devtools subscribers over
//! `/ws/trace` and the `trace.stream@1` capability.

mod hub;
mod tracer;

pub use hub::TraceHub;
pub use tracer::{TraceContext, TraceRecord, TraceSpan, Tracer};
