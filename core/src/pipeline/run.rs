use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::ids::uuid_12;
use crate::memory::LayeredMemory;
use crate::pipeline::Stage;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Ephemeral per-call run context: a shared mutable bag (`run_ctx`) plus
/// lifecycle state. Handlers communicate by merging maps into the bag.
pub struct Run {
    pub run_id: String,
    pub kind: String,
    pub session_id: String,
    pub created_ms: i64,
    memory: LayeredMemory,
    status: Mutex<RunStatus>,
    finished_ms: Mutex<Option<i64>>,
    stage: Mutex<Option<Stage>>,
    ctx: Mutex<Map<String, Value>>,
    cancel: CancellationToken,
}

impl Run {
    pub(crate) fn new(
        kind: &str,
        session_id: &str,
        memory: LayeredMemory,
        initial_input: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Self {
        let mut ctx = Map::new();
        ctx.insert("input".to_string(), Value::Object(initial_input));
        ctx.insert("queryItems".to_string(), json!([]));
        ctx.insert("promptDraft".to_string(), json!({}));
        ctx.insert("engineRequest".to_string(), Value::Null);
        ctx.insert("engineResponse".to_string(), Value::Null);
        ctx.insert("extractedArtifacts".to_string(), json!({}));
        ctx.insert("messagesDelta".to_string(), json!([]));

        Self {
            run_id: uuid_12("pipelineRun_"),
            kind: kind.to_string(),
            session_id: session_id.to_string(),
            created_ms: now_ms(),
            memory,
            status: Mutex::new(RunStatus::Running),
            finished_ms: Mutex::new(None),
            stage: Mutex::new(None),
            ctx: Mutex::new(ctx),
            cancel,
        }
    }

    /// The owning session's memory stack; staged writes go through here.
    pub fn memory(&self) -> &LayeredMemory {
        &self.memory
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }

    pub fn current_stage(&self) -> Option<Stage> {
        *self.stage.lock()
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        *self.stage.lock() = Some(stage);
    }

    pub fn finished_ms(&self) -> Option<i64> {
        *self.finished_ms.lock()
    }

    // ----- run_ctx access -----

    pub fn get(&self, key: &str) -> Option<Value> {
        self.ctx.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.ctx.lock().insert(key.to_string(), value);
    }

    /// Append to a list entry, creating it if absent. Replaces non-list
    /// values with a fresh list.
    pub fn append(&self, list_key: &str, value: Value) {
        let mut ctx = self.ctx.lock();
        match ctx.get_mut(list_key) {
            Some(Value::Array(items)) => items.push(value),
            _ => {
                ctx.insert(list_key.to_string(), json!([value]));
            }
        }
    }

    /// Shallow-merge a handler's returned map into the bag.
    pub(crate) fn merge(&self, patch: Map<String, Value>) {
        let mut ctx = self.ctx.lock();
        for (key, value) in patch {
            ctx.insert(key, value);
        }
    }

    pub fn ctx_snapshot(&self) -> Map<String, Value> {
        self.ctx.lock().clone()
    }

    // ----- Lifecycle -----

    /// Fail the run, recording the reason under `error`. Remaining stages are
    /// skipped.
    pub fn fail(&self, reason: &str) {
        self.set("error", json!(reason));
        self.finish(RunStatus::Failed);
    }

    pub(crate) fn mark_cancelled(&self, reason: &str) {
        if !reason.is_empty() {
            self.set("cancelReason", json!(reason));
        }
        self.finish(RunStatus::Cancelled);
    }

    /// First terminal status wins; later transitions are ignored.
    pub(crate) fn finish(&self, status: RunStatus) {
        let mut current = self.status.lock();
        if *current != RunStatus::Running {
            return;
        }
        *current = status;
        *self.finished_ms.lock() = Some(now_ms());
    }
}
