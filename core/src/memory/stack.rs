use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TurnixError};
use crate::memory::{MemoryLayer, MemoryObject, MemoryResolver, TxnLayer};

/// Summary of what a commit changed, grouped per target layer.
#[derive(Debug, Clone, Default)]
pub struct CommitResult {
    /// layer name -> (set count, delete count)
    pub by_layer: BTreeMap<String, (usize, usize)>,
}

impl CommitResult {
    fn add_set(&mut self, layer: &str) {
        self.by_layer.entry(layer.to_string()).or_default().0 += 1;
    }

    fn add_delete(&mut self, layer: &str) {
        self.by_layer.entry(layer.to_string()).or_default().1 += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.by_layer.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.by_layer.values().map(|(s, d)| s + d).sum()
    }
}

/// Ordered read-through stack: `[txn, session, runtime, static, kernel...]`.
/// Cheap to clone; layers are shared `Arc`s.
#[derive(Clone)]
pub struct LayeredMemory {
    layers: Vec<Arc<dyn MemoryLayer>>,
    resolver: Arc<MemoryResolver>,
    txn: Arc<TxnLayer>,
}

impl LayeredMemory {
    /// Build a stack with a fresh transactional layer on top of `layers`.
    pub fn new(
        txn: Arc<TxnLayer>,
        below: Vec<Arc<dyn MemoryLayer>>,
        resolver: Arc<MemoryResolver>,
    ) -> Self {
        let mut layers: Vec<Arc<dyn MemoryLayer>> = vec![txn.clone()];
        layers.extend(below);
        Self {
            layers,
            resolver,
            txn,
        }
    }

    pub fn layers(&self) -> &[Arc<dyn MemoryLayer>] {
        &self.layers
    }

    /// Everything below the transactional layer. Spawned sessions share these.
    pub fn bottom_layers(&self) -> Vec<Arc<dyn MemoryLayer>> {
        self.layers[1..].to_vec()
    }

    pub fn txn(&self) -> &Arc<TxnLayer> {
        &self.txn
    }

    pub fn resolver(&self) -> &Arc<MemoryResolver> {
        &self.resolver
    }

    fn layer_by_name(&self, name: &str) -> Result<&Arc<dyn MemoryLayer>> {
        self.layers
            .iter()
            .find(|l| l.name() == name)
            .ok_or_else(|| TurnixError::LayerNotFound {
                layer: name.to_string(),
            })
    }

    fn ensure_origin(obj: &mut MemoryObject, layer_name: &str, path: &str) {
        if obj.origin_layer.is_empty() {
            obj.origin_layer = layer_name.to_string();
        }
        if obj.path.is_empty() {
            obj.path = path.to_string();
        }
    }

    /// Read through the stack, top to bottom; first non-absent value wins.
    /// A namespace-prefixed key reads only its mapped layer.
    pub fn get(&self, key: &str) -> Option<MemoryObject> {
        let (explicit, stripped) = self.resolver.normalize(key);
        if let Some(layer_name) = explicit {
            let layer = self.layer_by_name(layer_name).ok()?;
            let mut obj = layer.get(stripped)?;
            Self::ensure_origin(&mut obj, layer.name(), key);
            return Some(obj);
        }
        for layer in &self.layers {
            if let Some(mut obj) = layer.get(stripped) {
                Self::ensure_origin(&mut obj, layer.name(), key);
                return Some(obj);
            }
        }
        None
    }

    /// Linear scan by object uuid. Returns `(layer name, object)`.
    pub fn get_by_uuid(&self, uuid: &str, include_txn: bool) -> Option<(String, MemoryObject)> {
        for layer in &self.layers {
            if let Some(dict) = layer.as_dict() {
                for (_key, obj) in dict.latest_entries() {
                    if obj.uuid == uuid {
                        return Some((layer.name().to_string(), obj));
                    }
                }
            }
        }
        if include_txn {
            for (_key, obj) in self.txn.changes().into_iter().filter_map(|(k, o)| o.map(|o| (k, o))) {
                if obj.uuid == uuid {
                    return Some((self.txn.name().to_string(), obj));
                }
            }
        }
        None
    }

    /// Staged write: goes to the transactional layer only, applied at commit.
    pub fn save(&self, mut obj: MemoryObject) -> Result<String> {
        if obj.path.is_empty() {
            obj.path = if !obj.origin_layer.is_empty() {
                format!("{}.{}", obj.origin_layer, if obj.id.is_empty() { &obj.uuid } else { &obj.id })
            } else {
                format!("txn.{}", obj.uuid)
            };
        }
        let key = obj.path.clone();
        self.txn.set(&key, obj)?;
        Ok(key)
    }

    /// Direct write: the target layer is picked from the key's namespace
    /// prefix and written immediately, bypassing the transaction.
    pub fn save_persistent(&self, mut obj: MemoryObject) -> Result<String> {
        if obj.path.is_empty() {
            obj.path = if !obj.origin_layer.is_empty() {
                format!("{}.{}", obj.origin_layer, if obj.id.is_empty() { &obj.uuid } else { &obj.id })
            } else {
                format!("session.{}", if obj.id.is_empty() { &obj.uuid } else { &obj.id })
            };
        }
        let key = obj.path.clone();
        let target = self
            .resolver
            .pick_target_layer(&key, &self.layers[1..])?;
        if obj.origin_layer.is_empty() {
            obj.origin_layer = target.name().to_string();
        }
        let clean_key = self.resolver.strip_namespace(&key).to_string();
        target.set(&clean_key, obj)?;
        Ok(key)
    }

    /// Apply the transaction's change log to the layers below, in order.
    /// Requires at least one real layer under the txn.
    pub fn commit(&self) -> Result<CommitResult> {
        if self.layers.len() < 2 {
            return Err(TurnixError::MalformedStack);
        }

        let changes = self.txn.changes();
        let mut result = CommitResult::default();
        if changes.is_empty() {
            return Ok(result);
        }

        for (key, obj) in changes {
            let target = self.resolver.pick_target_layer(&key, &self.layers[1..])?;
            let clean_key = self.resolver.strip_namespace(&key);
            match obj {
                Some(obj) => {
                    target.set(clean_key, obj)?;
                    result.add_set(target.name());
                }
                None => {
                    target.delete(clean_key)?;
                    result.add_delete(target.name());
                }
            }
        }

        self.txn.clear();
        debug!(
            changes = result.total_changes(),
            layers = result.by_layer.len(),
            "memory commit applied"
        );
        Ok(result)
    }

    /// Drop all staged changes.
    pub fn rollback(&self) {
        self.txn.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DictLayer, ReadOnlyLayer};
    use serde_json::json;
    use std::collections::HashMap;

    fn stack() -> LayeredMemory {
        let txn = Arc::new(TxnLayer::new("txn"));
        let session = Arc::new(DictLayer::new("session", 3));
        let runtime = Arc::new(DictLayer::new("runtime", 3));
        let statik = Arc::new(ReadOnlyLayer::new("static", HashMap::new()));

        let mut ns = HashMap::new();
        ns.insert("session".to_string(), "session".to_string());
        ns.insert("runtime".to_string(), "runtime".to_string());

        LayeredMemory::new(
            txn,
            vec![session, runtime, statik],
            Arc::new(MemoryResolver::new(ns)),
        )
    }

    #[test]
    fn staged_save_is_invisible_below_until_commit() {
        let memory = stack();
        let obj = MemoryObject::new("m1", json!({"text": "hi"})).with_path("session.chat.m1");
        memory.save(obj).unwrap();

        // Visible through the stack (txn on top)...
        assert!(memory.get("session.chat.m1").is_some() || memory.txn().get("session.chat.m1").is_some());
        // ...but not in the session layer yet
        let session = memory.layers()[1].clone();
        assert!(session.get("chat.m1").is_none());

        let result = memory.commit().unwrap();
        assert_eq!(result.by_layer.get("session"), Some(&(1, 0)));
        assert!(session.get("chat.m1").is_some());
        assert!(memory.txn().is_clean());
    }

    #[test]
    fn commit_routes_by_namespace_and_strips_prefix() {
        let memory = stack();
        memory
            .save(MemoryObject::new("a", json!(1)).with_path("runtime.counters.a"))
            .unwrap();
        memory
            .save(MemoryObject::new("b", json!(2)).with_path("session.chat.b"))
            .unwrap();

        let result = memory.commit().unwrap();
        assert_eq!(result.by_layer.get("runtime"), Some(&(1, 0)));
        assert_eq!(result.by_layer.get("session"), Some(&(1, 0)));

        let runtime = memory.layers()[2].clone();
        assert!(runtime.get("counters.a").is_some());
    }

    #[test]
    fn rollback_drops_staged_changes() {
        let memory = stack();
        memory
            .save(MemoryObject::new("a", json!(1)).with_path("session.a"))
            .unwrap();
        memory.rollback();

        let result = memory.commit().unwrap();
        assert!(result.is_empty());
        let session = memory.layers()[1].clone();
        assert!(session.get("a").is_none());
    }

    #[test]
    fn commit_then_rollback_is_noop_and_empty_commit_changes_nothing() {
        let memory = stack();
        memory
            .save(MemoryObject::new("a", json!(1)).with_path("session.a"))
            .unwrap();
        memory.commit().unwrap();
        memory.rollback();

        let session = memory.layers()[1].clone();
        assert!(session.get("a").is_some());

        let result = memory.commit().unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn staged_delete_reaches_target_on_commit() {
        let memory = stack();
        memory
            .save_persistent(MemoryObject::new("a", json!(1)).with_path("session.a"))
            .unwrap();
        let session = memory.layers()[1].clone();
        assert!(session.get("a").is_some());

        memory.txn().delete("session.a").unwrap();
        let result = memory.commit().unwrap();
        assert_eq!(result.by_layer.get("session"), Some(&(0, 1)));
        assert!(session.get("a").is_none());
    }

    #[test]
    fn read_through_walks_top_to_bottom() {
        let memory = stack();
        let runtime = memory.layers()[2].clone();
        runtime
            .set("shared", MemoryObject::new("shared", json!("bottom")))
            .unwrap();

        let obj = memory.get("shared").unwrap();
        assert_eq!(obj.payload, json!("bottom"));
        assert_eq!(obj.origin_layer, "runtime");

        // A staged value shadows the one below
        memory
            .save(MemoryObject::new("shared", json!("staged")).with_path("shared"))
            .unwrap();
        let obj = memory.get("shared").unwrap();
        assert_eq!(obj.payload, json!("staged"));
    }

    #[test]
    fn save_persistent_derives_path_and_origin() {
        let memory = stack();
        let key = memory
            .save_persistent(MemoryObject::new("note", json!("x")))
            .unwrap();
        assert_eq!(key, "session.note");
        let obj = memory.get("session.note").unwrap();
        assert_eq!(obj.origin_layer, "session");
    }
}
