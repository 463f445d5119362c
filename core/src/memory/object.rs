use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::uuidv7;

fn default_version() -> u64 {
    1
}

/// Anything that lives in memory. Carries its origin so `save(obj)` works
/// without restating the path. Promptable units (chat messages, system
/// snippets) set `kind`; plain objects leave it empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryObject {
    pub id: String,
    pub payload: Value,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub origin_layer: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default = "default_version")]
    pub version: u64,
    /// "userMessage", "assistantMessage", "system", "memory", ... or empty.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl MemoryObject {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            path: String::new(),
            origin_layer: String::new(),
            uuid: uuidv7(),
            version: 1,
            kind: String::new(),
            meta: Map::new(),
        }
    }

    pub fn with_kind(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        let mut obj = Self::new(id, payload);
        obj.kind = kind.into();
        obj
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}
