//! AppInstance save/load.
//!
//! Layout under a save directory:
//!
//! ```text
//! save.json5                         # manifest + file index + metadata
//! state/snapshot.json5               # AppInstance snapshot
//! state/sessions/<sessionId>.json5   # one snapshot per session
//! state/sessions/<sessionId>_layers/ # per-dict-layer files for the session
//! preview.png                        # optional thumbnail (not indexed)
//! ```
//!
//! State files are written first, the manifest last (best-effort atomicity).
//! SHA-256 digests live in the manifest; a mismatch on load warns and
//! continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppInstance;
use crate::config::MemorySettings;
use crate::error::{Result, TurnixError};
use crate::memory::{load_layers_from_dir, save_layers_to_dir, MemoryLayer};
use crate::sessions::Session;
use crate::trace::Tracer;
use crate::util::{now_secs, sha256_hex, to_rel_path};

const SAVE_SCHEMA_VERSION: &str = "0.0.0";

fn write_json(path: &Path, value: &Value) -> Result<String> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, &text)?;
    Ok(sha256_hex(text.as_bytes()))
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn verify_checksum(path: &Path, expected: Option<&str>) {
    let Some(expected) = expected else {
        return;
    };
    match std::fs::read(path) {
        Ok(bytes) => {
            let actual = sha256_hex(&bytes);
            if actual != expected {
                warn!(
                    path = %path.display(),
                    expected,
                    actual,
                    "checksum mismatch on save file"
                );
            }
        }
        Err(err) => warn!(path = %path.display(), %err, "could not verify save file"),
    }
}

/// Save an AppInstance into `target_dir`. Returns the manifest path and its
/// SHA-256.
pub fn save_app_instance(
    instance: &Arc<AppInstance>,
    target_dir: &Path,
    label: Option<&str>,
    thumbnail: Option<&[u8]>,
) -> Result<(PathBuf, String)> {
    let root = target_dir.to_path_buf();
    let state_dir = root.join("state");
    let sessions_dir = state_dir.join("sessions");
    std::fs::create_dir_all(&sessions_dir)?;

    // 1) AppInstance snapshot
    let snapshot_path = state_dir.join("snapshot.json5");
    let snapshot_hash = write_json(&snapshot_path, &instance.snapshot())?;
    let mut files_index = json!({
        "appInstance": {
            "path": to_rel_path(&root, &snapshot_path),
            "sha256": snapshot_hash,
        },
        "sessions": {},
    });

    // 2) Session snapshots + per-layer directories
    let mut session_count = 0usize;
    for session_id in instance.list_sessions(None) {
        let Some(session) = instance.session(&session_id) else {
            continue;
        };
        let session_path = sessions_dir.join(format!("{session_id}.json5"));
        let session_hash = write_json(&session_path, &session.snapshot())?;

        let layers_dir = sessions_dir.join(format!("{session_id}_layers"));
        save_layers_to_dir(session.memory().layers(), &layers_dir)?;

        files_index["sessions"][&session_id] = json!({
            "path": to_rel_path(&root, &session_path),
            "sha256": session_hash,
            "layersDir": to_rel_path(&root, &layers_dir),
        });
        session_count += 1;
    }

    // 3) Optional thumbnail
    if let Some(thumbnail) = thumbnail {
        std::fs::write(root.join("preview.png"), thumbnail)?;
    }

    // 4) Manifest, written last
    let manifest = json!({
        "schemaVersion": SAVE_SCHEMA_VERSION,
        "appPackId": instance.app_pack_id,
        "appInstanceId": instance.id,
        "createdTs": instance.created_ms / 1000,
        "savedTs": now_secs(),
        "label": label.unwrap_or(""),
        "files": files_index,
        "mainSessionId": instance.main_session().map(|s| s.id.clone()),
    });
    let manifest_path = root.join("save.json5");
    let manifest_hash = write_json(&manifest_path, &manifest)?;

    info!(
        app_instance_id = instance.id,
        app_pack_id = instance.app_pack_id,
        dir = %root.display(),
        sessions = session_count,
        "app instance saved"
    );
    Ok((manifest_path, manifest_hash))
}

/// Load an AppInstance from `source_dir`: validate the manifest, rebuild the
/// instance and its sessions, hydrate session memory layers.
pub fn load_app_instance(
    source_dir: &Path,
    kernel_memory_layers: Vec<Arc<dyn MemoryLayer>>,
    memory_settings: MemorySettings,
    tracer: Tracer,
) -> Result<Arc<AppInstance>> {
    let root = source_dir.to_path_buf();
    let manifest_path = root.join("save.json5");
    if !manifest_path.exists() {
        return Err(TurnixError::bad_request(format!(
            "missing save manifest: {}",
            manifest_path.display()
        )));
    }
    let manifest = read_json(&manifest_path)?;

    let app_pack_id = manifest
        .get("appPackId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TurnixError::bad_request("save manifest missing 'appPackId'"))?;
    manifest
        .get("appInstanceId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TurnixError::bad_request("save manifest missing 'appInstanceId'"))?;

    // 1) AppInstance snapshot
    let app_meta = manifest
        .get("files")
        .and_then(|f| f.get("appInstance"))
        .cloned()
        .unwrap_or(Value::Null);
    let snapshot_rel = app_meta
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TurnixError::bad_request("manifest 'files.appInstance.path' is missing"))?;
    let snapshot_path = root.join(snapshot_rel);
    verify_checksum(&snapshot_path, app_meta.get("sha256").and_then(|v| v.as_str()));
    let snapshot = read_json(&snapshot_path)?;

    let instance = AppInstance::from_snapshot(
        // Sessions are rebuilt below from their own files, not the embedded
        // snapshots, so the layer directories line up with the manifest.
        &json!({
            "appInstanceId": snapshot.get("appInstanceId"),
            "version": snapshot.get("version"),
            "createdTs": snapshot.get("createdTs"),
        }),
        app_pack_id,
        &root,
        kernel_memory_layers,
        memory_settings.clone(),
        tracer.clone(),
    )?;

    // 2) Sessions
    let sessions_meta = manifest
        .get("files")
        .and_then(|f| f.get("sessions"))
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    for (session_id, meta) in &sessions_meta {
        let session_rel = meta.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
            TurnixError::bad_request(format!("session '{session_id}': missing 'path' in manifest"))
        })?;
        let session_path = root.join(session_rel);
        verify_checksum(&session_path, meta.get("sha256").and_then(|v| v.as_str()));

        let session_snapshot = read_json(&session_path)?;
        let session = Session::from_snapshot(
            &session_snapshot,
            instance.bottom_layers(),
            instance.save_root.clone(),
            memory_settings.clone(),
            tracer.clone(),
        )?;

        let layers_dir = meta
            .get("layersDir")
            .and_then(|v| v.as_str())
            .map(|rel| root.join(rel))
            .unwrap_or_else(|| {
                session_path
                    .parent()
                    .unwrap_or(&root)
                    .join(format!("{session_id}_layers"))
            });
        if let Err(err) = load_layers_from_dir(session.memory().layers(), &layers_dir, true) {
            warn!(session_id, layers_dir = %layers_dir.display(), %err, "failed to load session layers");
        }

        instance.adopt_session(session);
    }

    // 3) Main session pointer
    let main_session_id = manifest
        .get("mainSessionId")
        .and_then(|v| v.as_str())
        .or_else(|| snapshot.get("mainSessionId").and_then(|v| v.as_str()));
    if let Some(main_id) = main_session_id {
        instance.set_main_session(main_id);
    }

    info!(
        app_instance_id = instance.id,
        app_pack_id = instance.app_pack_id,
        dir = %root.display(),
        sessions = sessions_meta.len(),
        "app instance loaded"
    );
    Ok(instance)
}
