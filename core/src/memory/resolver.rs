use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TurnixError};
use crate::memory::MemoryLayer;

/// Maps key namespace prefixes like `session.` or `runtime.` to concrete
/// layer names. Unprefixed keys go to the topmost writable layer.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    ns_to_layer_name: HashMap<String, String>,
}

impl MemoryResolver {
    pub fn new(ns_to_layer_name: HashMap<String, String>) -> Self {
        Self { ns_to_layer_name }
    }

    /// Split `key` into its mapped layer name (if the first dotted segment is
    /// a known namespace) and the remaining key.
    pub fn normalize<'a>(&self, key: &'a str) -> (Option<&str>, &'a str) {
        if let Some((ns, rest)) = key.split_once('.') {
            if !rest.is_empty() {
                if let Some(layer) = self.ns_to_layer_name.get(ns) {
                    return (Some(layer.as_str()), rest);
                }
            }
        }
        (None, key)
    }

    /// The key with any known namespace prefix removed.
    pub fn strip_namespace<'a>(&self, key: &'a str) -> &'a str {
        self.normalize(key).1
    }

    /// Choose the layer a write to `key` lands in: the namespace-mapped layer
    /// when the prefix is known, otherwise the first writable layer.
    pub fn pick_target_layer(
        &self,
        key: &str,
        layers: &[Arc<dyn MemoryLayer>],
    ) -> Result<Arc<dyn MemoryLayer>> {
        let (explicit, _) = self.normalize(key);
        if let Some(layer_name) = explicit {
            return layers
                .iter()
                .find(|l| l.name() == layer_name)
                .cloned()
                .ok_or_else(|| TurnixError::LayerNotFound {
                    layer: layer_name.to_string(),
                });
        }

        layers
            .iter()
            .find(|l| l.can_write())
            .cloned()
            .ok_or(TurnixError::NoWritableLayer)
    }
}
