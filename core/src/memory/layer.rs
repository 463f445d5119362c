use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;

use crate::error::{Result, TurnixError};
use crate::memory::MemoryObject;

/// Minimal layer interface. Layers do not know about other layers; the stack
/// walks them in order. Layers are shared across sessions through `Arc`, so
/// every method takes `&self` and state lives behind a mutex.
impl fmt::Debug for dyn MemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLayer").field("name", &self.name()).finish()
    }
}

pub trait MemoryLayer: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Option<MemoryObject>;
    fn set(&self, key: &str, value: MemoryObject) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    fn can_write(&self) -> bool {
        true
    }

    // ----- Persistence helpers -----

    fn dirty_keys(&self) -> HashSet<String> {
        HashSet::new()
    }

    fn clear_dirty(&self) {}

    fn revision(&self) -> u64 {
        0
    }

    /// Called after a successful save so the layer can record counters for
    /// policy decisions.
    fn mark_clean_snapshot(&self) {}

    // ----- Downcast hooks (persistence and the commit protocol need the
    // concrete layer kinds without `Any` gymnastics) -----

    fn as_dict(&self) -> Option<&DictLayer> {
        None
    }

    fn as_txn(&self) -> Option<&TxnLayer> {
        None
    }
}

// ---------------------------------------------------------------- //
// Read-only layer
// ---------------------------------------------------------------- //

/// Static content hydrated from assets; writes are rejected.
pub struct ReadOnlyLayer {
    name: String,
    data: HashMap<String, MemoryObject>,
}

impl ReadOnlyLayer {
    pub fn new(name: impl Into<String>, data: HashMap<String, MemoryObject>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl MemoryLayer for ReadOnlyLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<MemoryObject> {
        self.data.get(key).cloned()
    }

    fn set(&self, _key: &str, _value: MemoryObject) -> Result<()> {
        Err(TurnixError::LayerReadOnly {
            layer: self.name.clone(),
        })
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Err(TurnixError::LayerReadOnly {
            layer: self.name.clone(),
        })
    }

    fn can_write(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------- //
// Dict layer
// ---------------------------------------------------------------- //

#[derive(Default)]
struct DictState {
    data: HashMap<String, Vec<MemoryObject>>,
    dirty: HashSet<String>,
    revision: u64,
    last_saved_revision: u64,
}

/// Generic mutable layer: session, runtime, kernel, whatever.
/// - Keeps the last N versions per key.
/// - Tracks dirty keys and a monotonically increasing revision for change
///   detection.
pub struct DictLayer {
    name: String,
    max_versions_to_keep: usize,
    state: Mutex<DictState>,
}

impl DictLayer {
    pub fn new(name: impl Into<String>, max_versions_to_keep: usize) -> Self {
        Self {
            name: name.into(),
            max_versions_to_keep: max_versions_to_keep.max(1),
            state: Mutex::new(DictState::default()),
        }
    }

    /// Latest object per key, sorted by key for deterministic snapshots.
    pub fn latest_entries(&self) -> Vec<(String, MemoryObject)> {
        let state = self.state.lock();
        let mut out: Vec<(String, MemoryObject)> = state
            .data
            .iter()
            .filter_map(|(key, versions)| {
                versions.last().map(|obj| (key.clone(), obj.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Replace the layer's content wholesale (load path). Does not mark keys
    /// dirty: freshly hydrated content is clean by definition.
    pub fn hydrate(&self, entries: Vec<(String, MemoryObject)>) {
        let mut state = self.state.lock();
        state.data.clear();
        for (key, obj) in entries {
            state.data.insert(key, vec![obj]);
        }
        state.dirty.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }
}

impl MemoryLayer for DictLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<MemoryObject> {
        let state = self.state.lock();
        state.data.get(key).and_then(|v| v.last()).cloned()
    }

    fn set(&self, key: &str, value: MemoryObject) -> Result<()> {
        let mut state = self.state.lock();
        let versions = state.data.entry(key.to_string()).or_default();
        versions.push(value);
        let len = versions.len();
        if len > self.max_versions_to_keep {
            versions.drain(..len - self.max_versions_to_keep);
        }
        state.dirty.insert(key.to_string());
        state.revision += 1;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.data.remove(key);
        state.dirty.insert(key.to_string());
        state.revision += 1;
        Ok(())
    }

    fn dirty_keys(&self) -> HashSet<String> {
        self.state.lock().dirty.clone()
    }

    fn clear_dirty(&self) {
        self.state.lock().dirty.clear();
    }

    fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    fn mark_clean_snapshot(&self) {
        let mut state = self.state.lock();
        state.last_saved_revision = state.revision;
    }

    fn as_dict(&self) -> Option<&DictLayer> {
        Some(self)
    }
}

// ---------------------------------------------------------------- //
// Transactional layer
// ---------------------------------------------------------------- //

#[derive(Default)]
struct TxnState {
    staged: HashMap<String, MemoryObject>,
    changes: Vec<(String, Option<MemoryObject>)>,
    allow_writes: bool,
}

/// Top layer, one per session. Stores staged changes as an ordered change
/// log; never persisted directly.
pub struct TxnLayer {
    name: String,
    state: Mutex<TxnState>,
}

impl TxnLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TxnState {
                allow_writes: true,
                ..TxnState::default()
            }),
        }
    }

    /// Ordered change log snapshot: `(key, Some(obj))` for sets,
    /// `(key, None)` for deletes.
    pub fn changes(&self) -> Vec<(String, Option<MemoryObject>)> {
        self.state.lock().changes.clone()
    }

    pub fn is_clean(&self) -> bool {
        self.state.lock().changes.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.staged.clear();
        state.changes.clear();
    }

    pub fn set_allow_writes(&self, allow: bool) {
        self.state.lock().allow_writes = allow;
    }
}

impl MemoryLayer for TxnLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<MemoryObject> {
        self.state.lock().staged.get(key).cloned()
    }

    fn set(&self, key: &str, value: MemoryObject) -> Result<()> {
        let mut state = self.state.lock();
        if !state.allow_writes {
            return Err(TurnixError::LayerReadOnly {
                layer: self.name.clone(),
            });
        }
        state.staged.insert(key.to_string(), value.clone());
        state.changes.push((key.to_string(), Some(value)));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.staged.remove(key);
        state.changes.push((key.to_string(), None));
        Ok(())
    }

    fn can_write(&self) -> bool {
        self.state.lock().allow_writes
    }

    fn as_txn(&self) -> Option<&TxnLayer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dict_layer_keeps_last_n_versions() {
        let layer = DictLayer::new("session", 3);
        for i in 0..5 {
            layer
                .set("greeting", MemoryObject::new("greeting", json!(i)))
                .unwrap();
        }
        let obj = layer.get("greeting").unwrap();
        assert_eq!(obj.payload, json!(4));
        assert_eq!(layer.revision(), 5);
        assert_eq!(layer.dirty_keys().len(), 1);

        layer.clear_dirty();
        assert!(layer.dirty_keys().is_empty());
    }

    #[test]
    fn dict_delete_marks_dirty() {
        let layer = DictLayer::new("session", 3);
        layer
            .set("a", MemoryObject::new("a", json!(1)))
            .unwrap();
        layer.clear_dirty();
        layer.delete("a").unwrap();
        assert!(layer.get("a").is_none());
        assert!(layer.dirty_keys().contains("a"));
    }

    #[test]
    fn read_only_layer_rejects_writes() {
        let layer = ReadOnlyLayer::new("static", HashMap::new());
        let err = layer
            .set("k", MemoryObject::new("k", json!(null)))
            .unwrap_err();
        assert!(matches!(err, TurnixError::LayerReadOnly { .. }));
        assert!(!layer.can_write());
    }

    #[test]
    fn txn_layer_records_change_log_in_order() {
        let txn = TxnLayer::new("txn");
        txn.set("a", MemoryObject::new("a", json!(1))).unwrap();
        txn.delete("a").unwrap();
        txn.set("b", MemoryObject::new("b", json!(2))).unwrap();

        let changes = txn.changes();
        assert_eq!(changes.len(), 3);
        assert!(changes[0].1.is_some());
        assert!(changes[1].1.is_none());
        assert_eq!(changes[2].0, "b");

        // Staged read-through sees only live keys
        assert!(txn.get("a").is_none());
        assert!(txn.get("b").is_some());

        txn.clear();
        assert!(txn.is_clean());
    }
}
