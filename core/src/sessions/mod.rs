//! Sessions: conversation/inference contexts.
//!
//! A session owns a memory stack (transactional layer on top of shared
//! bottom layers) and exactly one pipeline. Sessions are always created
//! through `AppInstance::make_session`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::MemorySettings;
use crate::error::{Result, TurnixError};
use crate::ids::uuid_12;
use crate::memory::{
    CommitResult, DictLayer, LayeredMemory, MemoryLayer, MemoryResolver, SaveManager,
    SavePolicy, TxnLayer,
};
use crate::pipeline::{register_builtin_subscribers, Pipeline};
use crate::trace::{TraceContext, Tracer};
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// World-authoritative timeline; one per AppInstance.
    Main,
    /// Private scratch context, usually owner-view bound.
    Hidden,
    /// Publicly announced, short-lived shared context.
    Temporary,
    /// App menu / launcher context.
    Shell,
}

impl SessionKind {
    fn id_prefix(&self) -> &'static str {
        match self {
            SessionKind::Main => "ms_",
            SessionKind::Hidden => "hs_",
            SessionKind::Temporary => "ts_",
            SessionKind::Shell => "sh_",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Main => "main",
            SessionKind::Hidden => "hidden",
            SessionKind::Temporary => "temporary",
            SessionKind::Shell => "shell",
        }
    }

    pub fn parse(raw: &str) -> Option<SessionKind> {
        match raw {
            "main" => Some(SessionKind::Main),
            "hidden" => Some(SessionKind::Hidden),
            "temporary" => Some(SessionKind::Temporary),
            "shell" => Some(SessionKind::Shell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionVisibility {
    Public,
    Private,
}

impl SessionVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionVisibility::Public => "public",
            SessionVisibility::Private => "private",
        }
    }
}

pub struct Session {
    pub kind: SessionKind,
    pub id: String,
    /// Default chat thread for this session.
    pub thread_id: String,
    pub created_ms: i64,
    pub owner_view_id: Option<String>,
    pub visibility: SessionVisibility,
    version: AtomicU64,
    memory: LayeredMemory,
    pipeline: Arc<Pipeline>,
    save_manager: Arc<SaveManager>,
    save_path: PathBuf,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("thread_id", &self.thread_id)
            .field("created_ms", &self.created_ms)
            .field("owner_view_id", &self.owner_view_id)
            .field("visibility", &self.visibility)
            .finish()
    }
}

impl Session {
    /// Build a session over `shared_bottom_layers`. The stack becomes
    /// `[txn, session:<id>, ...bottom]`, and the default chat subscribers are
    /// wired into the fresh pipeline.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SessionKind,
        session_id: Option<String>,
        owner_view_id: Option<String>,
        visibility: SessionVisibility,
        shared_bottom_layers: Vec<Arc<dyn MemoryLayer>>,
        save_path: PathBuf,
        memory_settings: MemorySettings,
        tracer: Tracer,
    ) -> Arc<Session> {
        Self::build(
            kind,
            session_id,
            None,
            None,
            owner_view_id,
            visibility,
            shared_bottom_layers,
            save_path,
            memory_settings,
            tracer,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: SessionKind,
        session_id: Option<String>,
        thread_id: Option<String>,
        created_ms: Option<i64>,
        owner_view_id: Option<String>,
        visibility: SessionVisibility,
        shared_bottom_layers: Vec<Arc<dyn MemoryLayer>>,
        save_path: PathBuf,
        memory_settings: MemorySettings,
        tracer: Tracer,
    ) -> Arc<Session> {
        let id = session_id.unwrap_or_else(|| uuid_12(kind.id_prefix()));
        let thread_id = thread_id.unwrap_or_else(|| uuid_12("t_"));
        let session_layer_name = format!("session:{id}");

        let txn = Arc::new(TxnLayer::new("txn"));
        let session_layer: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new(
            session_layer_name.clone(),
            memory_settings.max_versions_per_key,
        ));

        // Namespace map: "session." plus each bottom layer by its own name.
        let mut ns = std::collections::HashMap::new();
        ns.insert("session".to_string(), session_layer_name.clone());
        for layer in &shared_bottom_layers {
            let name = layer.name().to_string();
            if !name.contains('.') {
                ns.insert(name.clone(), name);
            }
        }
        let resolver = Arc::new(MemoryResolver::new(ns));

        let mut below: Vec<Arc<dyn MemoryLayer>> = vec![session_layer.clone()];
        below.extend(shared_bottom_layers);
        let memory = LayeredMemory::new(txn, below, resolver);

        let layers_dir = save_path
            .join("state")
            .join("sessions")
            .join(format!("{id}_layers"));
        let save_manager = Arc::new(SaveManager::new(layers_dir));
        save_manager.register_layer(
            session_layer,
            SavePolicy {
                debounce_ms: memory_settings.save_debounce_ms,
                max_interval_ms: memory_settings.save_max_interval_ms,
                max_dirty_items: memory_settings.save_max_dirty_items,
            },
        );

        let context = TraceContext::new().with("sessionId", id.clone());
        let pipeline = Arc::new(Pipeline::new(
            &id,
            memory.clone(),
            save_path.clone(),
            save_manager.clone(),
            memory_settings,
            tracer,
            context,
        ));
        register_builtin_subscribers(&pipeline, &thread_id);

        Arc::new(Session {
            kind,
            id,
            thread_id,
            created_ms: created_ms.unwrap_or_else(now_ms),
            owner_view_id,
            visibility,
            version: AtomicU64::new(0),
            memory,
            pipeline,
            save_manager,
            save_path,
        })
    }

    pub fn memory(&self) -> &LayeredMemory {
        &self.memory
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn save_path(&self) -> &PathBuf {
        &self.save_path
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether a view may see this session: hidden sessions with an owner are
    /// invisible to everyone else.
    pub fn visible_to(&self, view_id: &str) -> bool {
        match (&self.kind, &self.owner_view_id) {
            (SessionKind::Hidden, Some(owner)) => owner == view_id,
            _ => self.visibility == SessionVisibility::Public,
        }
    }

    /// Run the commit protocol and hand the result to the save policy.
    pub fn save_memory(&self) -> Result<CommitResult> {
        let result = self.memory.commit()?;
        self.save_manager.on_committed(&result);
        Ok(result)
    }

    /// Persist every registered layer regardless of policy state.
    pub fn flush_memory(&self) {
        self.save_manager.flush_all();
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "id": self.id,
            "kind": self.kind.as_str(),
            "threadId": self.thread_id,
            "version": self.version(),
            "createdTs": self.created_ms,
            "ownerViewId": self.owner_view_id,
            "visibility": self.visibility.as_str(),
        })
    }

    /// Rebuild a session shell from a snapshot. Memory layers are hydrated
    /// separately from the per-layer files.
    pub fn from_snapshot(
        snapshot: &Value,
        shared_bottom_layers: Vec<Arc<dyn MemoryLayer>>,
        save_path: PathBuf,
        memory_settings: MemorySettings,
        tracer: Tracer,
    ) -> Result<Arc<Session>> {
        let id = snapshot
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TurnixError::bad_request("session snapshot missing 'id'"))?;
        let kind = snapshot
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(SessionKind::parse)
            .ok_or_else(|| TurnixError::bad_request("session snapshot missing 'kind'"))?;
        let visibility = match snapshot.get("visibility").and_then(|v| v.as_str()) {
            Some("private") => SessionVisibility::Private,
            _ => SessionVisibility::Public,
        };
        let owner_view_id = snapshot
            .get("ownerViewId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let thread_id = snapshot
            .get("threadId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let session = Self::build(
            kind,
            Some(id.to_string()),
            thread_id,
            snapshot.get("createdTs").and_then(|v| v.as_i64()),
            owner_view_id,
            visibility,
            shared_bottom_layers,
            save_path,
            memory_settings,
            tracer,
        );
        if let Some(version) = snapshot.get("version").and_then(|v| v.as_u64()) {
            session.version.store(version, Ordering::SeqCst);
        }
        Ok(session)
    }

    /// Cancel ongoing pipeline runs (fire-and-forget).
    pub fn destroy(&self) {
        self.pipeline.cancel_all();
    }

    /// Cancel ongoing pipeline runs and wait until their rollbacks finished.
    pub async fn destroy_and_wait(&self) {
        self.pipeline.cancel_all_and_wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObject;
    use crate::trace::TraceHub;

    fn tracer() -> Tracer {
        Tracer::new(Arc::new(TraceHub::new(64, 64)))
    }

    fn session(dir: &std::path::Path) -> Arc<Session> {
        let runtime: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new("runtime", 3));
        Session::new(
            SessionKind::Main,
            None,
            None,
            SessionVisibility::Public,
            vec![runtime],
            dir.to_path_buf(),
            MemorySettings::default(),
            tracer(),
        )
    }

    #[test]
    fn stack_shape_and_id_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        assert!(session.id.starts_with("ms_"));
        let names: Vec<&str> = session.memory().layers().iter().map(|l| l.name()).collect();
        assert_eq!(names[0], "txn");
        assert!(names[1].starts_with("session:"));
        assert_eq!(names[2], "runtime");
    }

    #[test]
    fn save_memory_commits_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        session
            .memory()
            .save(MemoryObject::new("note", json!({"v": 1})).with_path("session.note"))
            .unwrap();
        let result = session.save_memory().unwrap();
        assert_eq!(result.total_changes(), 1);

        // Immediate policy wrote the session layer file
        let layers_dir = dir
            .path()
            .join("state")
            .join("sessions")
            .join(format!("{}_layers", session.id));
        assert!(layers_dir.exists());
        assert_eq!(std::fs::read_dir(&layers_dir).unwrap().count(), 1);
    }

    #[test]
    fn snapshot_round_trip_preserves_identity() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        session.bump_version();
        let snapshot = session.snapshot();

        let runtime: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new("runtime", 3));
        let restored = Session::from_snapshot(
            &snapshot,
            vec![runtime],
            dir.path().to_path_buf(),
            MemorySettings::default(),
            tracer(),
        )
        .unwrap();
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.kind, SessionKind::Main);
        assert_eq!(restored.thread_id, session.thread_id);
        assert_eq!(restored.version(), 1);
    }

    #[test]
    fn hidden_sessions_with_owner_are_invisible_to_others() {
        let dir = tempfile::tempdir().unwrap();
        let runtime: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new("runtime", 3));
        let hidden = Session::new(
            SessionKind::Hidden,
            None,
            Some("view_owner".to_string()),
            SessionVisibility::Private,
            vec![runtime],
            dir.path().to_path_buf(),
            MemorySettings::default(),
            tracer(),
        );
        assert!(hidden.visible_to("view_owner"));
        assert!(!hidden.visible_to("view_other"));
    }
}
