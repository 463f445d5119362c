use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::MemorySettings;
use crate::error::{Result, TurnixError};
use crate::ids::uuid_12;
use crate::memory::{DictLayer, MemoryLayer, ReadOnlyLayer};
use crate::sessions::{Session, SessionKind, SessionVisibility};
use crate::trace::Tracer;
use crate::util::now_ms;

fn is_valid_app_pack_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
}

/// A live, in-memory instance of an application.
///
/// - Manages sessions (creation, lookup, main-session tracking)
/// - Holds its runtime/static memory layers plus kernel-provided bottoms
/// - Knows which packs are allowed for this instance
/// - Provides the save directory for persistence
pub struct AppInstance {
    pub app_pack_id: String,
    pub id: String,
    pub save_root: PathBuf,
    pub created_ms: i64,
    version: AtomicU64,

    runtime_memory: Arc<dyn MemoryLayer>,
    static_memory: Arc<dyn MemoryLayer>,
    kernel_bottom: Vec<Arc<dyn MemoryLayer>>,

    sessions: Mutex<HashMap<String, Arc<Session>>>,
    main_session: Mutex<Option<Arc<Session>>>,
    allowed_packs: Mutex<HashSet<String>>,

    memory_settings: MemorySettings,
    tracer: Tracer,
}

impl std::fmt::Debug for AppInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppInstance")
            .field("app_pack_id", &self.app_pack_id)
            .field("id", &self.id)
            .field("save_root", &self.save_root)
            .field("created_ms", &self.created_ms)
            .finish()
    }
}

impl AppInstance {
    /// Construct an instance with its save root at
    /// `<save_base>/<appPackId>/<instanceId>/` (reused as-is when
    /// `save_base` already points there).
    pub fn new(
        app_pack_id: &str,
        app_instance_id: Option<String>,
        save_base: &Path,
        kernel_memory_layers: Vec<Arc<dyn MemoryLayer>>,
        memory_settings: MemorySettings,
        tracer: Tracer,
        create_main_session: bool,
    ) -> Result<Arc<AppInstance>> {
        let app_pack_id = app_pack_id.trim().to_string();
        if !is_valid_app_pack_id(&app_pack_id) {
            return Err(TurnixError::bad_request(format!(
                "appPackId '{app_pack_id}' contains invalid characters"
            )));
        }
        let id = app_instance_id.unwrap_or_else(|| uuid_12("appInstanceId_"));

        let save_root = if save_base.file_name().map(|n| n.to_string_lossy() == id.as_str())
            == Some(true)
            && save_base
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy() == app_pack_id.as_str())
                == Some(true)
        {
            save_base.to_path_buf()
        } else {
            save_base.join(&app_pack_id).join(&id)
        };
        std::fs::create_dir_all(&save_root)?;

        let instance = Arc::new(AppInstance {
            app_pack_id,
            id,
            save_root,
            created_ms: now_ms(),
            version: AtomicU64::new(0),
            runtime_memory: Arc::new(DictLayer::new(
                "runtime",
                memory_settings.max_versions_per_key,
            )),
            static_memory: Arc::new(ReadOnlyLayer::new("static", HashMap::new())),
            kernel_bottom: kernel_memory_layers,
            sessions: Mutex::new(HashMap::new()),
            main_session: Mutex::new(None),
            allowed_packs: Mutex::new(HashSet::new()),
            memory_settings,
            tracer,
        });

        if create_main_session {
            instance.make_session(SessionKind::Main, None, None, SessionVisibility::Public)?;
        }

        debug!(
            app_pack_id = instance.app_pack_id,
            app_instance_id = instance.id,
            save_root = %instance.save_root.display(),
            "app instance created"
        );
        Ok(instance)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Bottom layers sessions inherit: runtime above static above kernel.
    pub fn bottom_layers(&self) -> Vec<Arc<dyn MemoryLayer>> {
        let mut out: Vec<Arc<dyn MemoryLayer>> =
            vec![self.runtime_memory.clone(), self.static_memory.clone()];
        out.extend(self.kernel_bottom.iter().cloned());
        out
    }

    pub fn runtime_memory(&self) -> &Arc<dyn MemoryLayer> {
        &self.runtime_memory
    }

    /// Create a session owned by this instance. A second main session is
    /// rejected.
    pub fn make_session(
        &self,
        kind: SessionKind,
        session_id: Option<String>,
        owner_view_id: Option<String>,
        visibility: SessionVisibility,
    ) -> Result<Arc<Session>> {
        if kind == SessionKind::Main {
            if let Some(existing) = self.main_session.lock().as_ref() {
                return Err(TurnixError::MainSessionExists {
                    app_instance_id: self.id.clone(),
                    session_id: existing.id.clone(),
                });
            }
        }

        let session = Session::new(
            kind,
            session_id,
            owner_view_id,
            visibility,
            self.bottom_layers(),
            self.save_root.clone(),
            self.memory_settings.clone(),
            self.tracer.clone(),
        );

        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        if kind == SessionKind::Main {
            *self.main_session.lock() = Some(session.clone());
        }
        self.bump_version();
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn main_session(&self) -> Option<Arc<Session>> {
        self.main_session.lock().clone()
    }

    pub fn list_sessions(&self, kind: Option<SessionKind>) -> Vec<String> {
        let sessions = self.sessions.lock();
        let mut ids: Vec<String> = sessions
            .values()
            .filter(|s| kind.map_or(true, |k| s.kind == k))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Destroy a non-main session: cancel its runs, wait for their rollbacks,
    /// then drop it. The main session lives as long as the instance.
    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        if let Some(main) = self.main_session.lock().as_ref() {
            if main.id == session_id {
                return Err(TurnixError::MainSessionProtected {
                    session_id: session_id.to_string(),
                });
            }
        }
        let session = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| TurnixError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        session.destroy_and_wait().await;
        self.sessions.lock().remove(session_id);
        self.bump_version();
        Ok(())
    }

    pub fn set_allowed_packs(&self, allowed: HashSet<String>) {
        *self.allowed_packs.lock() = allowed;
    }

    pub fn allowed_packs(&self) -> HashSet<String> {
        self.allowed_packs.lock().clone()
    }

    pub fn snapshot(&self) -> Value {
        let sessions = self.sessions.lock();
        let session_snapshots: serde_json::Map<String, Value> = sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.snapshot()))
            .collect();
        json!({
            "appPackId": self.app_pack_id,
            "appInstanceId": self.id,
            "saveRoot": self.save_root.to_string_lossy(),
            "version": self.version(),
            "createdTs": self.created_ms,
            "mainSessionId": self.main_session.lock().as_ref().map(|s| s.id.clone()),
            "sessions": session_snapshots,
        })
    }

    /// Reconstruct an instance shell from a snapshot (pure data, no layer
    /// hydration).
    pub fn from_snapshot(
        snapshot: &Value,
        app_pack_id: &str,
        save_base: &Path,
        kernel_memory_layers: Vec<Arc<dyn MemoryLayer>>,
        memory_settings: MemorySettings,
        tracer: Tracer,
    ) -> Result<Arc<AppInstance>> {
        let instance_id = snapshot
            .get("appInstanceId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let instance = AppInstance::new(
            app_pack_id,
            instance_id,
            save_base,
            kernel_memory_layers,
            memory_settings.clone(),
            tracer.clone(),
            false,
        )?;

        if let Some(version) = snapshot.get("version").and_then(|v| v.as_u64()) {
            instance.version.store(version, Ordering::SeqCst);
        }

        if let Some(sessions) = snapshot.get("sessions").and_then(|v| v.as_object()) {
            for (session_id, session_snapshot) in sessions {
                let session = Session::from_snapshot(
                    session_snapshot,
                    instance.bottom_layers(),
                    instance.save_root.clone(),
                    memory_settings.clone(),
                    tracer.clone(),
                )?;
                instance
                    .sessions
                    .lock()
                    .insert(session_id.clone(), session);
            }
        }

        let main_session_id = snapshot.get("mainSessionId").and_then(|v| v.as_str());
        let main = match main_session_id {
            Some(id) => instance.sessions.lock().get(id).cloned(),
            None => None,
        };
        if let Some(main) = main {
            *instance.main_session.lock() = Some(main);
        } else {
            // Deterministic fallback: lowest session id, if any.
            let sessions = instance.sessions.lock();
            let mut ids: Vec<&String> = sessions.keys().collect();
            ids.sort();
            if let Some(first) = ids.first() {
                debug!(app_instance_id = instance.id, "no mainSessionId in snapshot; picking first");
                *instance.main_session.lock() = sessions.get(*first).cloned();
            }
        }

        Ok(instance)
    }

    /// Register a session rebuilt by the load path.
    pub(crate) fn adopt_session(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .insert(session.id.clone(), session);
    }

    /// Point the main-session handle at an already-adopted session.
    pub(crate) fn set_main_session(&self, session_id: &str) {
        let sessions = self.sessions.lock();
        if let Some(session) = sessions.get(session_id) {
            *self.main_session.lock() = Some(session.clone());
        }
    }

    /// Tear the instance down: cancel every session's runs and wait for
    /// quiescence before dropping them.
    pub async fn destroy(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.destroy_and_wait().await;
        }
        self.sessions.lock().clear();
        *self.main_session.lock() = None;
        self.bump_version();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceHub;

    fn tracer() -> Tracer {
        Tracer::new(Arc::new(TraceHub::new(64, 64)))
    }

    fn instance(dir: &Path) -> Arc<AppInstance> {
        AppInstance::new(
            "turnix@ai-chat",
            None,
            dir,
            Vec::new(),
            MemorySettings::default(),
            tracer(),
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn main_session_is_unique_and_protected() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance(dir.path());

        let main = instance.main_session().unwrap();
        assert_eq!(main.kind, SessionKind::Main);

        let err = instance
            .make_session(SessionKind::Main, None, None, SessionVisibility::Public)
            .unwrap_err();
        assert!(matches!(err, TurnixError::MainSessionExists { .. }));

        let err = instance.destroy_session(&main.id).await.unwrap_err();
        assert!(matches!(err, TurnixError::MainSessionProtected { .. }));
    }

    #[tokio::test]
    async fn non_main_sessions_can_be_destroyed() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance(dir.path());
        let hidden = instance
            .make_session(
                SessionKind::Hidden,
                None,
                Some("view_1".to_string()),
                SessionVisibility::Private,
            )
            .unwrap();

        assert_eq!(instance.list_sessions(None).len(), 2);
        instance.destroy_session(&hidden.id).await.unwrap();
        assert_eq!(instance.list_sessions(None).len(), 1);

        let err = instance.destroy_session(&hidden.id).await.unwrap_err();
        assert!(matches!(err, TurnixError::SessionNotFound { .. }));
    }

    #[test]
    fn save_root_layout() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance(dir.path());
        assert!(instance
            .save_root
            .starts_with(dir.path().join("turnix@ai-chat")));
        assert!(instance.save_root.exists());

        // Passing the save root back in reuses it unchanged
        let again = AppInstance::new(
            "turnix@ai-chat",
            Some(instance.id.clone()),
            &instance.save_root,
            Vec::new(),
            MemorySettings::default(),
            tracer(),
            false,
        )
        .unwrap();
        assert_eq!(again.save_root, instance.save_root);
    }

    #[test]
    fn rejects_invalid_app_pack_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppInstance::new(
            "bad id!",
            None,
            dir.path(),
            Vec::new(),
            MemorySettings::default(),
            tracer(),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, TurnixError::BadRequest { .. }));
    }

    #[test]
    fn sessions_share_instance_bottom_layers() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance(dir.path());
        let session_a = instance.main_session().unwrap();
        let session_b = instance
            .make_session(SessionKind::Temporary, None, None, SessionVisibility::Public)
            .unwrap();

        instance
            .runtime_memory()
            .set(
                "shared",
                crate::memory::MemoryObject::new("shared", json!(42)),
            )
            .unwrap();
        assert_eq!(
            session_a.memory().get("shared").unwrap().payload,
            json!(42)
        );
        assert_eq!(
            session_b.memory().get("shared").unwrap().payload,
            json!(42)
        );
    }
}
