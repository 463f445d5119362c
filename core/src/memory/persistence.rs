//! Layer snapshots on disk.
//!
//! Only dict layers participate: the txn layer is ephemeral by design and
//! read-only layers are reconstructed from assets. Each dict layer becomes
//! one JSON file in a layers directory; loading hydrates existing layers by
//! name and ignores unknown ones.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::memory::{MemoryLayer, MemoryObject};

pub const SNAPSHOT_FORMAT: &str = "turnix.memory.layers";

#[derive(Debug, Serialize, Deserialize)]
struct LayerSnapshot {
    name: String,
    kind: String,
    entries: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayersFile {
    version: u32,
    format: String,
    layers: Vec<LayerSnapshot>,
}

fn snapshot_dict_layer(layer: &Arc<dyn MemoryLayer>) -> Option<LayerSnapshot> {
    let dict = layer.as_dict()?;
    let mut entries = serde_json::Map::new();
    for (key, obj) in dict.latest_entries() {
        if let Ok(value) = serde_json::to_value(&obj) {
            entries.insert(key, value);
        }
    }
    Some(LayerSnapshot {
        name: layer.name().to_string(),
        kind: "DictMemoryLayer".to_string(),
        entries,
    })
}

/// Full snapshot of all dict layers in the stack as a JSON value.
pub fn snapshot_layers(layers: &[Arc<dyn MemoryLayer>]) -> Value {
    let snapshots: Vec<LayerSnapshot> = layers.iter().filter_map(snapshot_dict_layer).collect();
    serde_json::to_value(LayersFile {
        version: 1,
        format: SNAPSHOT_FORMAT.to_string(),
        layers: snapshots,
    })
    .unwrap_or(Value::Null)
}

/// File names may not contain layer-name separators like `:`.
fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Write one file per dict layer into `dir`, creating it if needed.
pub fn save_layers_to_dir(layers: &[Arc<dyn MemoryLayer>], dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for layer in layers {
        let Some(snapshot) = snapshot_dict_layer(layer) else {
            continue;
        };
        let file = LayersFile {
            version: 1,
            format: SNAPSHOT_FORMAT.to_string(),
            layers: vec![snapshot],
        };
        let path = dir.join(format!("{}.json5", sanitize_file_stem(layer.name())));
        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, text)?;
    }
    Ok(())
}

fn hydrate_layer(layer: &Arc<dyn MemoryLayer>, snapshot: &LayerSnapshot) {
    let Some(dict) = layer.as_dict() else {
        return;
    };
    let mut entries: Vec<(String, MemoryObject)> = Vec::new();
    for (key, value) in &snapshot.entries {
        match serde_json::from_value::<MemoryObject>(value.clone()) {
            Ok(mut obj) => {
                if obj.path.is_empty() {
                    obj.path = key.clone();
                }
                if obj.origin_layer.is_empty() {
                    obj.origin_layer = layer.name().to_string();
                }
                entries.push((key.clone(), obj));
            }
            Err(err) => {
                warn!(layer = layer.name(), key, %err, "skipping unreadable memory entry");
            }
        }
    }
    dict.hydrate(entries);
}

/// Load per-layer files from `dir` and hydrate the layers we already have by
/// name. Missing directory is fine when `missing_ok`; unknown layers in the
/// files are ignored.
pub fn load_layers_from_dir(
    layers: &[Arc<dyn MemoryLayer>],
    dir: &Path,
    missing_ok: bool,
) -> Result<()> {
    if !dir.exists() {
        if missing_ok {
            return Ok(());
        }
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("layers directory '{}' does not exist", dir.display()),
        )
        .into());
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_layer_file = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json5") | Some("json")
        );
        if !path.is_file() || !is_layer_file {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        let file: LayersFile = match serde_json::from_str(&text) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable layer file");
                continue;
            }
        };
        for snapshot in &file.layers {
            if let Some(layer) = layers.iter().find(|l| l.name() == snapshot.name) {
                hydrate_layer(layer, snapshot);
            }
        }
    }
    Ok(())
}
