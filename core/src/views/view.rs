use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::uuid_12;

/// Wire shape of a view, sent with `welcome` and on state reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub view_id: String,
    pub app_pack_id: String,
    pub view_kind: String,
    pub version: u64,
    pub state: Map<String, Value>,
    pub attached_session_ids: Vec<String>,
}

struct ViewState {
    app_pack_id: String,
    state: Map<String, Value>,
    version: u64,
    attached_session_ids: BTreeSet<String>,
}

/// Backend representation of a single frontend instance: authoritative UI
/// state plus the set of sessions the view is attached to.
pub struct View {
    pub id: String,
    pub view_kind: String,
    inner: Mutex<ViewState>,
}

impl View {
    pub fn new(view_id: Option<String>, view_kind: &str, app_pack_id: &str) -> Self {
        let view_kind = if view_kind.trim().is_empty() {
            "main"
        } else {
            view_kind.trim()
        };
        let mut state = Map::new();
        state.insert("viewKind".to_string(), Value::String(view_kind.to_string()));
        Self {
            id: view_id.unwrap_or_else(|| uuid_12("view_")),
            view_kind: view_kind.to_string(),
            inner: Mutex::new(ViewState {
                app_pack_id: app_pack_id.to_string(),
                state,
                version: 0,
                attached_session_ids: BTreeSet::new(),
            }),
        }
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn app_pack_id(&self) -> String {
        self.inner.lock().app_pack_id.clone()
    }

    pub fn set_app_pack_id(&self, app_pack_id: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.app_pack_id = app_pack_id.to_string();
        inner.version += 1;
        inner.version
    }

    pub fn attach_session(&self, session_id: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.attached_session_ids.insert(session_id.to_string());
        inner.version += 1;
        inner.version
    }

    pub fn detach_session(&self, session_id: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.attached_session_ids.remove(session_id);
        inner.version += 1;
        inner.version
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.inner.lock().attached_session_ids.contains(session_id)
    }

    /// Shallow-merge a patch into the state dictionary.
    pub fn patch_state(&self, patch: Map<String, Value>) -> u64 {
        let mut inner = self.inner.lock();
        for (key, value) in patch {
            inner.state.insert(key, value);
        }
        inner.version += 1;
        inner.version
    }

    pub fn state(&self) -> Map<String, Value> {
        self.inner.lock().state.clone()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let inner = self.inner.lock();
        ViewSnapshot {
            view_id: self.id.clone(),
            app_pack_id: inner.app_pack_id.clone(),
            view_kind: self.view_kind.clone(),
            version: inner.version,
            state: inner.state.clone(),
            attached_session_ids: inner.attached_session_ids.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attach_detach_bump_version() {
        let view = View::new(None, "main", "turnix@main_menu");
        assert!(view.id.starts_with("view_"));
        assert_eq!(view.version(), 0);

        view.attach_session("ms_1");
        view.attach_session("ts_2");
        view.detach_session("ts_2");
        assert_eq!(view.version(), 3);
        assert!(view.is_attached("ms_1"));
        assert!(!view.is_attached("ts_2"));
    }

    #[test]
    fn snapshot_sorts_session_ids_and_carries_state() {
        let view = View::new(None, "main", "turnix@main_menu");
        view.attach_session("zz");
        view.attach_session("aa");
        view.patch_state(Map::from_iter([(
            "serverMessage".to_string(),
            json!("hello"),
        )]));

        let snapshot = view.snapshot();
        assert_eq!(snapshot.attached_session_ids, vec!["aa", "zz"]);
        assert_eq!(snapshot.state["serverMessage"], "hello");
        assert_eq!(snapshot.state["viewKind"], "main");
        assert_eq!(snapshot.version, 3);
    }

    #[test]
    fn empty_view_kind_defaults_to_main() {
        let view = View::new(None, "  ", "app");
        assert_eq!(view.view_kind, "main");
    }
}
