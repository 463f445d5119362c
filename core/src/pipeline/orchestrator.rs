use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MemorySettings;
use crate::error::Result;
use crate::ids::uuid_12;
use crate::memory::{LayeredMemory, SaveManager};
use crate::pipeline::{ChunkStream, EventBus, Run, RunStatus, Stage};
use crate::sessions::{Session, SessionKind, SessionVisibility};
use crate::trace::{TraceContext, Tracer};

/// Stage subscriber delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubMode {
    /// Invoked once when the stage runs; `payload` is None.
    Once,
    /// Invoked for every streamed chunk of `ParseStreamedResponse`.
    PerChunk,
}

/// A mod-provided stage handler. A returned map is shallow-merged into the
/// run context; an error fails the run (except in per-chunk mode, where it is
/// captured in `chunkErrors`).
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, run: &Arc<Run>, payload: Option<&Value>)
        -> Result<Option<Map<String, Value>>>;
}

/// Adapter for plain closures, mostly used by tests and simple mods.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> StageHandler for FnHandler<F>
where
    F: Fn(&Arc<Run>, Option<&Value>) -> Result<Option<Map<String, Value>>> + Send + Sync,
{
    async fn handle(
        &self,
        run: &Arc<Run>,
        payload: Option<&Value>,
    ) -> Result<Option<Map<String, Value>>> {
        (self.0)(run, payload)
    }
}

/// The engine adapter, set by the active LLM driver mod. Returns a stream of
/// chunk objects the orchestrator feeds to `ParseStreamedResponse`
/// subscribers.
#[async_trait]
pub trait EngineCaller: Send + Sync {
    async fn stream(&self, run: &Arc<Run>) -> Result<ChunkStream>;
}

struct StageSub {
    sub_id: String,
    priority: i32,
    mode: SubMode,
    handler: Arc<dyn StageHandler>,
}

struct RunEntry {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Orchestrates stage progression and mod subscriptions. Each session has
/// exactly one pipeline.
pub struct Pipeline {
    session_id: String,
    memory: LayeredMemory,
    save_path: PathBuf,
    save_manager: Arc<SaveManager>,
    memory_settings: MemorySettings,
    tracer: Tracer,
    context: TraceContext,

    stage_order: Vec<Stage>,
    subs: Mutex<HashMap<Stage, Vec<StageSub>>>,
    active_runs: Mutex<HashMap<String, RunEntry>>,
    engine_caller: Mutex<Option<Arc<dyn EngineCaller>>>,
    engine_call_before_fanout: AtomicBool,
    pub events: EventBus,

    hidden_session_subs: Mutex<Vec<(String, Arc<dyn StageHandler>)>>,
    temporary_session_subs: Mutex<Vec<(String, Arc<dyn StageHandler>)>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: &str,
        memory: LayeredMemory,
        save_path: PathBuf,
        save_manager: Arc<SaveManager>,
        memory_settings: MemorySettings,
        tracer: Tracer,
        context: TraceContext,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            memory,
            save_path,
            save_manager,
            memory_settings,
            tracer,
            context,
            stage_order: Stage::ORDER.to_vec(),
            subs: Mutex::new(HashMap::new()),
            active_runs: Mutex::new(HashMap::new()),
            engine_caller: Mutex::new(None),
            engine_call_before_fanout: AtomicBool::new(true),
            events: EventBus::new(),
            hidden_session_subs: Mutex::new(Vec::new()),
            temporary_session_subs: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ----- Subscriptions -----

    pub fn subscribe_to_stage(
        &self,
        stage: Stage,
        handler: Arc<dyn StageHandler>,
        priority: i32,
        mode: SubMode,
    ) -> String {
        let sub_id = uuid_12("sub_");
        self.subs.lock().entry(stage).or_default().push(StageSub {
            sub_id: sub_id.clone(),
            priority,
            mode,
            handler,
        });
        sub_id
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subs = self.subs.lock();
        for stage_subs in subs.values_mut() {
            let before = stage_subs.len();
            stage_subs.retain(|s| s.sub_id != subscription_id);
            if stage_subs.len() != before {
                return true;
            }
        }
        false
    }

    // ----- Spawned-session notifications (opt-in) -----

    pub fn on_hidden_session_created(&self, handler: Arc<dyn StageHandler>) -> String {
        let sub_id = uuid_12("subHidden_");
        self.hidden_session_subs.lock().push((sub_id.clone(), handler));
        sub_id
    }

    pub fn off_hidden_session_created(&self, subscription_id: &str) -> bool {
        let mut subs = self.hidden_session_subs.lock();
        let before = subs.len();
        subs.retain(|(id, _)| id != subscription_id);
        subs.len() != before
    }

    pub fn on_temporary_session_created(&self, handler: Arc<dyn StageHandler>) -> String {
        let sub_id = uuid_12("subTemporary_");
        self.temporary_session_subs
            .lock()
            .push((sub_id.clone(), handler));
        sub_id
    }

    pub fn off_temporary_session_created(&self, subscription_id: &str) -> bool {
        let mut subs = self.temporary_session_subs.lock();
        let before = subs.len();
        subs.retain(|(id, _)| id != subscription_id);
        subs.len() != before
    }

    // ----- Engine caller injection -----

    /// Register the engine adapter. The pipeline iterates its stream during
    /// `EngineCall`, dispatching chunks to `ParseStreamedResponse`
    /// subscribers before moving on.
    pub fn set_engine_caller(&self, caller: Arc<dyn EngineCaller>) {
        *self.engine_caller.lock() = Some(caller);
    }

    /// Whether `once` observers of `EngineCall` run before (false) or after
    /// (true, default) the engine stream.
    pub fn set_engine_call_order(&self, before_fanout: bool) {
        self.engine_call_before_fanout
            .store(before_fanout, Ordering::SeqCst);
    }

    // ----- Runs -----

    pub fn start_run(
        self: &Arc<Self>,
        kind: &str,
        initial_input: Map<String, Value>,
    ) -> Arc<Run> {
        let token = CancellationToken::new();
        let run = Arc::new(Run::new(
            kind,
            &self.session_id,
            self.memory.clone(),
            initial_input,
            token.clone(),
        ));

        let pipeline = self.clone();
        let task_run = run.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            pipeline.run_task(task_run, task_token).await;
        });

        self.active_runs.lock().insert(
            run.run_id.clone(),
            RunEntry {
                token,
                handle: Some(handle),
            },
        );
        run
    }

    pub fn active_run_ids(&self) -> Vec<String> {
        self.active_runs.lock().keys().cloned().collect()
    }

    /// Wait for a run's task to finish. Returns immediately when unknown.
    pub async fn await_run(&self, run_id: &str) {
        let handle = {
            let mut runs = self.active_runs.lock();
            runs.get_mut(run_id).and_then(|entry| entry.handle.take())
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Request cancellation of a run. The task observes the token, rolls the
    /// transaction back and finishes with status `cancelled`.
    pub fn cancel(&self, run_id: &str) -> bool {
        let runs = self.active_runs.lock();
        match runs.get(run_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.active_runs.lock().values() {
            entry.token.cancel();
        }
    }

    /// Cancel every active run and wait for their tasks to unwind, so
    /// rollbacks complete before teardown returns.
    pub async fn cancel_all_and_wait(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut runs = self.active_runs.lock();
            runs.values_mut()
                .filter_map(|entry| {
                    entry.token.cancel();
                    entry.handle.take()
                })
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ----- Session spawning -----

    /// Build an independent hidden session sharing this session's bottom
    /// memory layers. Hidden sessions are private to the creating mod.
    pub async fn create_hidden_session(&self, run: &Arc<Run>, label: &str) -> Arc<Session> {
        let session = Session::new(
            SessionKind::Hidden,
            None,
            None,
            SessionVisibility::Private,
            self.memory.bottom_layers(),
            self.save_path.clone(),
            self.memory_settings.clone(),
            self.tracer.clone(),
        );
        run.set(
            "spawnedSession",
            json!({"kind": "hidden", "label": label, "sessionId": session.id}),
        );
        let subs: Vec<Arc<dyn StageHandler>> = self
            .hidden_session_subs
            .lock()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in subs {
            if let Err(err) = handler.handle(run, None).await {
                warn!(%err, "hidden-session subscriber failed");
            }
        }
        session
    }

    /// Build an independent temporary session (public: listeners may opt in
    /// after notification).
    pub async fn create_temporary_session(&self, run: &Arc<Run>, label: &str) -> Arc<Session> {
        let session = Session::new(
            SessionKind::Temporary,
            None,
            None,
            SessionVisibility::Public,
            self.memory.bottom_layers(),
            self.save_path.clone(),
            self.memory_settings.clone(),
            self.tracer.clone(),
        );
        run.set(
            "spawnedSession",
            json!({"kind": "temporary", "label": label, "sessionId": session.id}),
        );
        let subs: Vec<Arc<dyn StageHandler>> = self
            .temporary_session_subs
            .lock()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in subs {
            if let Err(err) = handler.handle(run, None).await {
                warn!(%err, "temporary-session subscriber failed");
            }
        }
        session
    }

    // ----- Run task -----

    fn run_topic(run_id: &str) -> String {
        format!("run:{run_id}")
    }

    async fn run_task(self: Arc<Self>, run: Arc<Run>, token: CancellationToken) {
        let topic = Self::run_topic(&run.run_id);
        let context = self
            .context
            .clone()
            .with("sessionId", self.session_id.clone())
            .with("pipelineRunId", run.run_id.clone());
        let span = self.tracer.start_span(
            "pipeline.run",
            None,
            &context,
            Some(Map::from_iter([("kind".to_string(), json!(run.kind))])),
            &["pipeline"],
        );

        self.events
            .publish(&topic, json!({"kind": "runStarted", "runId": run.run_id}));

        let engine_caller = self.engine_caller.lock().clone();

        for stage in self.stage_order.clone() {
            if token.is_cancelled() {
                run.mark_cancelled("");
            }
            if !run.is_running() {
                break;
            }
            run.set_stage(stage);
            self.tracer.event(
                "pipeline.stage.enter",
                "debug",
                &["pipeline", "stage"],
                Some(&span),
                &context,
                Some(Map::from_iter([("stage".to_string(), json!(stage.as_str()))])),
            );

            match stage {
                Stage::EngineCall if engine_caller.is_some() => {
                    let caller = engine_caller.as_ref().unwrap().clone();
                    let before_fanout = self.engine_call_before_fanout.load(Ordering::SeqCst);

                    // Let observers tweak engineRequest before the stream
                    // starts when the engine runs last.
                    if !before_fanout {
                        self.fanout_once(stage, &run, &token).await;
                        if !run.is_running() {
                            break;
                        }
                    }

                    self.stream_engine(&caller, &run, &token, &topic).await;
                    if !run.is_running() {
                        break;
                    }

                    if before_fanout {
                        self.fanout_once(stage, &run, &token).await;
                    }
                }
                // Chunk-only stage: delivery happens during the engine stream.
                Stage::ParseStreamedResponse => {}
                _ => {
                    self.fanout_once(stage, &run, &token).await;
                }
            }
        }

        // Terminalization + memory boundary.
        if token.is_cancelled() && run.is_running() {
            run.mark_cancelled("");
        }
        match run.status() {
            RunStatus::Running => match run.memory().commit() {
                Ok(result) => {
                    self.save_manager.on_committed(&result);
                    run.finish(RunStatus::Succeeded);
                }
                Err(err) => {
                    run.memory().rollback();
                    run.fail(&format!("commitFailed: {err}"));
                }
            },
            _ => {
                run.memory().rollback();
            }
        }

        let status = run.status();
        self.events.publish(
            &topic,
            json!({"kind": "runCompleted", "status": status.as_str()}),
        );
        self.tracer.event(
            "pipeline.end",
            "info",
            &["pipeline"],
            Some(&span),
            &context,
            Some(Map::from_iter([("status".to_string(), json!(status.as_str()))])),
        );
        let trace_status = match status {
            RunStatus::Succeeded => "ok",
            RunStatus::Cancelled => "cancelled",
            _ => "error",
        };
        let mut end_attrs = Map::new();
        end_attrs.insert("runStatus".to_string(), json!(status.as_str()));
        if let Some(Value::String(error)) = run.get("error") {
            end_attrs.insert("error".to_string(), json!(error));
        }
        self.tracer
            .end_span(&span, trace_status, Some(end_attrs), &["pipeline"]);

        self.active_runs.lock().remove(&run.run_id);
    }

    async fn stream_engine(
        &self,
        caller: &Arc<dyn EngineCaller>,
        run: &Arc<Run>,
        token: &CancellationToken,
        topic: &str,
    ) {
        let mut stream = match caller.stream(run).await {
            Ok(stream) => stream,
            Err(err) => {
                run.fail(&format!("engineStreamError: {err}"));
                return;
            }
        };

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    run.mark_cancelled("");
                    return;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    self.events
                        .publish(topic, json!({"kind": "chunk", "chunk": chunk.clone()}));
                    self.emit_chunk(run, &chunk).await;
                    if !run.is_running() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    run.fail(&format!("engineStreamError: {err}"));
                    return;
                }
                None => return,
            }
        }
    }

    fn stage_handlers(&self, stage: Stage, mode: SubMode) -> Vec<Arc<dyn StageHandler>> {
        let subs = self.subs.lock();
        let Some(stage_subs) = subs.get(&stage) else {
            return Vec::new();
        };
        // Ascending priority; insertion order within the same priority.
        let mut picked: Vec<(i32, Arc<dyn StageHandler>)> = stage_subs
            .iter()
            .filter(|s| s.mode == mode)
            .map(|s| (s.priority, s.handler.clone()))
            .collect();
        picked.sort_by_key(|(priority, _)| *priority);
        picked.into_iter().map(|(_, h)| h).collect()
    }

    /// Fanout `once` handlers in priority order. A returned map merges into
    /// the run context; an error or a `run.fail()` aborts remaining stages.
    async fn fanout_once(&self, stage: Stage, run: &Arc<Run>, token: &CancellationToken) {
        for handler in self.stage_handlers(stage, SubMode::Once) {
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    run.mark_cancelled("");
                    return;
                }
                outcome = handler.handle(run, None) => outcome,
            };
            match outcome {
                Ok(Some(patch)) => run.merge(patch),
                Ok(None) => {}
                Err(err) => {
                    run.fail(&format!("handlerError@{}: {err}", stage.as_str()));
                    return;
                }
            }
            if !run.is_running() {
                return;
            }
        }
    }

    /// Deliver one chunk to `perChunk` subscribers. These must not fail the
    /// run; errors are appended to `chunkErrors`.
    async fn emit_chunk(&self, run: &Arc<Run>, chunk: &Value) {
        for handler in self.stage_handlers(Stage::ParseStreamedResponse, SubMode::PerChunk) {
            match handler.handle(run, Some(chunk)).await {
                Ok(Some(patch)) => run.merge(patch),
                Ok(None) => {}
                Err(err) => {
                    debug!(%err, "per-chunk handler failed");
                    run.append(
                        "chunkErrors",
                        json!(format!("ParseStreamedResponse: {err}")),
                    );
                }
            }
        }
    }
}
