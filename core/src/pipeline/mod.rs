//! Per-session LLM orchestration.
//!
//! Each session owns exactly one [`Pipeline`]. A run walks the stage order,
//! fanning out to mod subscribers per stage; the engine call streams chunks
//! through `ParseStreamedResponse` subscribers; memory writes stage in the
//! session's transactional layer and commit only when the run succeeds.

mod builtins;
mod bus;
mod orchestrator;
mod run;
mod stages;

pub use builtins::register_builtin_subscribers;
pub use bus::EventBus;
pub use orchestrator::{EngineCaller, FnHandler, Pipeline, StageHandler, SubMode};
pub use run::{Run, RunStatus};
pub use stages::Stage;

/// Chunk stream produced by an engine caller.
pub type ChunkStream =
    futures::stream::BoxStream<'static, crate::error::Result<serde_json::Value>>;
