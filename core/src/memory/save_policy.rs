//! When to persist dirty layers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::memory::persistence::save_layers_to_dir;
use crate::memory::{CommitResult, MemoryLayer};
use crate::util::now_ms;

/// Per-layer thresholds. All-zero means "save immediately after every commit
/// that left the layer dirty".
#[derive(Debug, Clone, Copy, Default)]
pub struct SavePolicy {
    pub debounce_ms: u64,
    pub max_interval_ms: u64,
    pub max_dirty_items: usize,
}

impl SavePolicy {
    fn is_immediate(&self) -> bool {
        self.debounce_ms == 0 && self.max_interval_ms == 0 && self.max_dirty_items == 0
    }
}

struct LayerRegistration {
    layer: Arc<dyn MemoryLayer>,
    policy: SavePolicy,
    last_saved_ms: i64,
    pending_since_ms: i64,
}

/// Keeps per-layer registrations and decides when to persist. Call
/// `on_committed` after each pipeline commit; `flush_all` at shutdown.
pub struct SaveManager {
    base_dir: PathBuf,
    by_name: Mutex<HashMap<String, LayerRegistration>>,
}

impl SaveManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            by_name: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Register a dict layer for policy-driven persistence. Non-dict layers
    /// are ignored.
    pub fn register_layer(&self, layer: Arc<dyn MemoryLayer>, policy: SavePolicy) {
        if layer.as_dict().is_none() {
            return;
        }
        let name = layer.name().to_string();
        self.by_name.lock().insert(
            name,
            LayerRegistration {
                layer,
                policy,
                last_saved_ms: 0,
                pending_since_ms: 0,
            },
        );
    }

    /// Mark layers the commit touched as pending and run the policy over all
    /// registrations.
    pub fn on_committed(&self, result: &CommitResult) {
        let now = now_ms();
        let mut regs = self.by_name.lock();

        for layer_name in result.by_layer.keys() {
            if let Some(reg) = regs.get_mut(layer_name) {
                if !reg.layer.dirty_keys().is_empty() && reg.pending_since_ms == 0 {
                    reg.pending_since_ms = now;
                }
            }
        }

        for reg in regs.values_mut() {
            Self::maybe_save(&self.base_dir, reg, now);
        }
    }

    pub fn flush_layer(&self, layer_name: &str) -> bool {
        let mut regs = self.by_name.lock();
        match regs.get_mut(layer_name) {
            Some(reg) => {
                Self::save_now(&self.base_dir, reg);
                true
            }
            None => false,
        }
    }

    pub fn flush_all(&self) {
        let mut regs = self.by_name.lock();
        for reg in regs.values_mut() {
            Self::save_now(&self.base_dir, reg);
        }
    }

    // ----- Internal -----

    fn maybe_save(base_dir: &PathBuf, reg: &mut LayerRegistration, now: i64) {
        let dirty = reg.layer.dirty_keys();
        if dirty.is_empty() {
            reg.pending_since_ms = 0;
            return;
        }

        let pol = reg.policy;
        if pol.max_dirty_items > 0 && dirty.len() >= pol.max_dirty_items {
            Self::save_now(base_dir, reg);
            return;
        }
        if pol.max_interval_ms > 0 && (now - reg.last_saved_ms) as u64 >= pol.max_interval_ms {
            Self::save_now(base_dir, reg);
            return;
        }
        if pol.debounce_ms > 0
            && reg.pending_since_ms > 0
            && (now - reg.pending_since_ms) as u64 >= pol.debounce_ms
        {
            Self::save_now(base_dir, reg);
            return;
        }
        if pol.is_immediate() {
            Self::save_now(base_dir, reg);
        }
    }

    fn save_now(base_dir: &PathBuf, reg: &mut LayerRegistration) {
        if let Err(err) = Self::write_layer(base_dir, &reg.layer) {
            warn!(layer = reg.layer.name(), %err, "failed to persist memory layer");
            return;
        }
        reg.layer.clear_dirty();
        reg.layer.mark_clean_snapshot();
        reg.last_saved_ms = now_ms();
        reg.pending_since_ms = 0;
    }

    fn write_layer(base_dir: &PathBuf, layer: &Arc<dyn MemoryLayer>) -> Result<()> {
        save_layers_to_dir(std::slice::from_ref(layer), base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DictLayer, MemoryObject};
    use serde_json::json;

    fn committed_for(layer: &str) -> CommitResult {
        let mut result = CommitResult::default();
        result.by_layer.insert(layer.to_string(), (1, 0));
        result
    }

    #[test]
    fn immediate_policy_saves_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SaveManager::new(dir.path());
        let layer: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new("session", 3));
        manager.register_layer(layer.clone(), SavePolicy::default());

        layer.set("k", MemoryObject::new("k", json!(1))).unwrap();
        manager.on_committed(&committed_for("session"));

        assert!(dir.path().join("session.json5").exists());
        assert!(layer.dirty_keys().is_empty());
    }

    #[test]
    fn thresholded_policy_defers_until_dirty_count() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SaveManager::new(dir.path());
        let layer: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new("session", 3));
        manager.register_layer(
            layer.clone(),
            SavePolicy {
                max_dirty_items: 3,
                debounce_ms: 60_000,
                ..SavePolicy::default()
            },
        );

        layer.set("a", MemoryObject::new("a", json!(1))).unwrap();
        manager.on_committed(&committed_for("session"));
        assert!(!dir.path().join("session.json5").exists());

        layer.set("b", MemoryObject::new("b", json!(2))).unwrap();
        layer.set("c", MemoryObject::new("c", json!(3))).unwrap();
        manager.on_committed(&committed_for("session"));
        assert!(dir.path().join("session.json5").exists());
    }

    #[test]
    fn flush_all_writes_regardless_of_policy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SaveManager::new(dir.path());
        let layer: Arc<dyn MemoryLayer> = Arc::new(DictLayer::new("runtime", 3));
        manager.register_layer(
            layer.clone(),
            SavePolicy {
                debounce_ms: 60_000,
                ..SavePolicy::default()
            },
        );
        layer.set("k", MemoryObject::new("k", json!(1))).unwrap();
        manager.flush_all();
        assert!(dir.path().join("runtime.json5").exists());
    }
}
