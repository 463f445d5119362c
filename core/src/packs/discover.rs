//! Filesystem discovery of packs.
//!
//! A directory is a pack root when it contains `manifest.json5` or
//! `manifest.json`; descent stops there (no nested packs). Symlinks are
//! skipped unless enabled, and a resolved-path stack guards against loops.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, TurnixError};
use crate::packs::{LayerKind, PackDescriptor, PackKind, PackRequest, RootsService, VisibilityKind};
use crate::semver::{parse_version, Requirement};

const MANIFEST_NAMES: [&str; 2] = ["manifest.json5", "manifest.json"];

fn is_valid_pack_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

fn author_name(raw: &Value) -> Option<String> {
    match raw.get("author") {
        Some(Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Some(Value::Object(map)) => match map.get("name") {
            Some(Value::String(s)) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            _ => None,
        },
        _ => None,
    }
}

/// Parse a dependency value: either a bare semver range or a full
/// PackRefString (detected by `@`).
fn dependency_request(key: &str, value: &Value) -> Option<PackRequest> {
    let pack_tree_id = key.trim();
    if pack_tree_id.is_empty() {
        return None;
    }
    let text = value.as_str().map(str::trim).unwrap_or("");
    if text.is_empty() {
        return Some(PackRequest {
            author: None,
            pack_tree_id: pack_tree_id.to_string(),
            requirement: None,
            kind: Some(PackKind::Mod),
        });
    }
    if text.contains("://") {
        warn!(dep = key, value = text, "URI dependency selectors are not supported here");
        return None;
    }
    if text.contains('@') {
        match crate::packs::parse_pack_ref(text, Some(PackKind::Mod)) {
            Ok(req) => return Some(req),
            Err(err) => {
                warn!(dep = key, value = text, %err, "invalid pack ref in mods; treating as range");
            }
        }
    }
    let requirement = match Requirement::parse(text) {
        Ok(req) => req,
        Err(err) => {
            warn!(dep = key, value = text, %err, "invalid semver requirement in mods");
            None
        }
    };
    Some(PackRequest {
        author: None,
        pack_tree_id: pack_tree_id.to_string(),
        requirement,
        kind: Some(PackKind::Mod),
    })
}

fn hard_dependencies(kind: PackKind, raw: &Value) -> Vec<PackRequest> {
    // Only appPack and viewPack have well-known "mods" right now.
    if !matches!(kind, PackKind::App | PackKind::View) {
        return Vec::new();
    }
    match raw.get("mods") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(key, value)| dependency_request(key, value))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .filter_map(|id| dependency_request(id, &Value::Null))
            .collect(),
        _ => Vec::new(),
    }
}

fn recommended_dependencies(raw: &Value) -> Vec<PackRequest> {
    let Some(items) = raw
        .get("meta")
        .and_then(|m| m.get("recommends"))
        .and_then(|r| r.as_array())
    else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_str())
        .filter_map(|text| crate::packs::parse_pack_ref(text, Some(PackKind::Mod)).ok())
        .collect()
}

fn runtime_entries(raw: &Value) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    let Some(runtimes) = raw
        .get("meta")
        .and_then(|m| m.get("runtimes"))
        .and_then(|r| r.as_object())
    else {
        return out;
    };
    for (name, value) in runtimes {
        match value {
            Value::String(path) => {
                out.insert(name.clone(), vec![path.clone()]);
            }
            Value::Array(paths) => {
                let list: Vec<String> = paths
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect();
                if !list.is_empty() {
                    out.insert(name.clone(), list);
                }
            }
            _ => {}
        }
    }
    out
}

/// Normalize a raw manifest object into an immutable descriptor.
pub fn normalize_manifest(
    raw: Value,
    manifest_path: &Path,
    base_root: &Path,
    layer: LayerKind,
) -> Result<PackDescriptor> {
    let invalid = |message: String| TurnixError::InvalidManifest {
        path: manifest_path.display().to_string(),
        message,
    };

    if !raw.is_object() {
        return Err(invalid("manifest is not a JSON object".into()));
    }

    let pack_id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if !is_valid_pack_id(&pack_id) {
        return Err(invalid(format!("invalid pack id '{pack_id}'")));
    }

    let kind_raw = raw
        .get("kind")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if kind_raw.is_empty() {
        return Err(invalid("missing kind".into()));
    }
    let kind = PackKind::parse(kind_raw)
        .ok_or_else(|| invalid(format!("unknown pack kind '{kind_raw}'")))?;

    let name = raw
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&pack_id)
        .to_string();

    // Unparseable versions leave the descriptor version-agnostic.
    let declared_version = raw
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| parse_version(s).ok());

    let declared_author = author_name(&raw);
    let effective_author = declared_author
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let visibility = match raw.get("visibility").and_then(|v| v.as_str()) {
        Some("public") => VisibilityKind::Public,
        Some("private") => VisibilityKind::Private,
        _ => {
            if kind == PackKind::Content {
                VisibilityKind::Public
            } else {
                VisibilityKind::Private
            }
        }
    };

    let import_from_parent = raw
        .get("importFromParent")
        .and_then(|v| v.as_bool())
        .unwrap_or(kind != PackKind::View);

    let description = raw
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let dependencies = hard_dependencies(kind, &raw);
    let recommended = recommended_dependencies(&raw);
    let entries = runtime_entries(&raw);

    Ok(PackDescriptor {
        local_id: pack_id.clone(),
        pack_tree_id: pack_id,
        kind,
        declared_author,
        declared_version: declared_version.clone(),
        effective_author,
        effective_version: declared_version,
        layer,
        base_root: base_root.to_path_buf(),
        pack_root: manifest_path.parent().unwrap_or(base_root).to_path_buf(),
        manifest_path: manifest_path.to_path_buf(),
        visibility,
        import_from_parent,
        dependencies,
        recommended,
        runtime_entries: entries,
        name,
        description,
        raw,
    })
}

struct WalkCtx<'a> {
    base_resolved: PathBuf,
    base_root: &'a Path,
    layer: LayerKind,
    allow_symlinks: bool,
    seen_manifests: &'a mut HashSet<PathBuf>,
    out: &'a mut Vec<PackDescriptor>,
}

fn walk_dir(dir: &Path, path_stack: &[PathBuf], ctx: &mut WalkCtx<'_>) {
    if !dir.is_dir() {
        return;
    }
    let is_symlink = dir
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_symlink && !ctx.allow_symlinks {
        debug!(path = %dir.display(), "skipping symlinked directory");
        return;
    }

    let resolved = match dir.canonicalize() {
        Ok(resolved) => resolved,
        Err(err) => {
            debug!(path = %dir.display(), %err, "skipping unreadable directory");
            return;
        }
    };
    if !resolved.starts_with(&ctx.base_resolved) {
        debug!(path = %resolved.display(), "skipping directory outside base root");
        return;
    }
    if path_stack.contains(&resolved) {
        if is_symlink {
            warn!(
                path = %resolved.display(),
                base = %ctx.base_resolved.display(),
                "detected symlink loop while scanning packs"
            );
        }
        return;
    }

    if let Some(manifest_path) = find_manifest(dir) {
        let manifest_resolved = manifest_path
            .canonicalize()
            .unwrap_or_else(|_| manifest_path.clone());
        if !ctx.seen_manifests.insert(manifest_resolved.clone()) {
            return;
        }
        match std::fs::read_to_string(&manifest_path)
            .map_err(TurnixError::from)
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(TurnixError::from))
            .and_then(|raw| {
                normalize_manifest(raw, &manifest_resolved, ctx.base_root, ctx.layer)
            }) {
            Ok(desc) => {
                debug!(
                    pack = desc.local_id,
                    kind = desc.kind.as_str(),
                    layer = desc.layer.as_str(),
                    dir = %desc.pack_root.display(),
                    "pack manifest found"
                );
                ctx.out.push(desc);
            }
            Err(err) => {
                warn!(manifest = %manifest_path.display(), %err, "failed to read pack manifest");
            }
        }
        // Do not descend below a pack root.
        return;
    }

    let mut next_stack = path_stack.to_vec();
    next_stack.push(resolved);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    children.sort();
    for child in children {
        walk_dir(&child, &next_stack, ctx);
    }
}

/// Scan all configured roots and return descriptors in discovery order.
/// Save roots are scanned first so their candidates win resolution ties.
pub fn discover_packs(roots: &RootsService, allow_symlinks: bool) -> Vec<PackDescriptor> {
    let mut out: Vec<PackDescriptor> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    fn scan(
        base: &Path,
        layer: LayerKind,
        allow_symlinks: bool,
        out: &mut Vec<PackDescriptor>,
        seen: &mut HashSet<PathBuf>,
    ) {
        let Ok(base_resolved) = base.canonicalize() else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(base) else {
            return;
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        children.sort();
        let mut ctx = WalkCtx {
            base_resolved,
            base_root: base,
            layer,
            allow_symlinks,
            seen_manifests: seen,
            out,
        };
        for child in children {
            walk_dir(&child, &[], &mut ctx);
        }
    }

    for base in roots.save_roots() {
        scan(&base, LayerKind::Saves, allow_symlinks, &mut out, &mut seen);
    }
    for (base, layer) in roots.content_roots() {
        scan(&base, layer, allow_symlinks, &mut out, &mut seen);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_manifest(dir: &Path, body: &Value) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("manifest.json5"), body.to_string()).unwrap();
    }

    #[test]
    fn normalizes_a_minimal_mod_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = json!({
            "id": "chat-history",
            "kind": "mod",
            "version": "1.2.3",
            "author": {"name": "Turnix"},
        });
        let desc = normalize_manifest(
            raw,
            &tmp.path().join("manifest.json5"),
            tmp.path(),
            LayerKind::FirstParty,
        )
        .unwrap();
        assert_eq!(desc.pack_tree_id, "chat-history");
        assert_eq!(desc.kind, PackKind::Mod);
        assert_eq!(desc.effective_author, "Turnix");
        assert_eq!(desc.effective_version.unwrap().to_string(), "1.2.3");
        assert_eq!(desc.visibility, VisibilityKind::Private);
        assert!(desc.import_from_parent);
    }

    #[test]
    fn rejects_bad_ids_and_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json5");
        assert!(normalize_manifest(
            json!({"id": "has spaces", "kind": "mod"}),
            &path,
            tmp.path(),
            LayerKind::Custom
        )
        .is_err());
        assert!(normalize_manifest(
            json!({"id": "ok", "kind": "weird"}),
            &path,
            tmp.path(),
            LayerKind::Custom
        )
        .is_err());
        assert!(normalize_manifest(json!({"id": "ok"}), &path, tmp.path(), LayerKind::Custom).is_err());
    }

    #[test]
    fn bad_version_leaves_descriptor_unversioned() {
        let tmp = tempfile::tempdir().unwrap();
        let desc = normalize_manifest(
            json!({"id": "m", "kind": "mod", "version": "not-a-version"}),
            &tmp.path().join("manifest.json5"),
            tmp.path(),
            LayerKind::Custom,
        )
        .unwrap();
        assert!(desc.effective_version.is_none());
    }

    #[test]
    fn app_manifest_mods_become_hard_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let desc = normalize_manifest(
            json!({
                "id": "ai-chat",
                "kind": "appPack",
                "mods": {
                    "chat-history": "^1.0.0",
                    "llm-prompt-builder": "",
                    "fancy": "Turnix@fancy@^2"
                }
            }),
            &tmp.path().join("manifest.json5"),
            tmp.path(),
            LayerKind::FirstParty,
        )
        .unwrap();
        assert_eq!(desc.dependencies.len(), 3);
        let fancy = desc
            .dependencies
            .iter()
            .find(|d| d.pack_tree_id == "fancy")
            .unwrap();
        assert_eq!(fancy.author.as_deref(), Some("Turnix"));
        assert!(fancy.requirement.is_some());
    }

    #[test]
    fn discovery_stops_at_pack_roots_and_prefers_saves_first() {
        let repo = tempfile::tempdir().unwrap();
        for name in crate::packs::roots::REQUIRED_SUBDIRS {
            std::fs::create_dir_all(repo.path().join(name)).unwrap();
        }

        // first-party pack with a nested directory that must not be scanned
        let pack_dir = repo.path().join("first-party").join("mods").join("foo");
        write_manifest(
            &pack_dir,
            &json!({"id": "foo", "kind": "mod", "version": "1.2.3", "author": "Turnix"}),
        );
        write_manifest(
            &pack_dir.join("nested"),
            &json!({"id": "nested", "kind": "mod"}),
        );

        // saves-layer copy of the same pack
        let save_pack = repo.path().join("saves").join("slot1").join("foo");
        write_manifest(
            &save_pack,
            &json!({"id": "foo", "kind": "mod", "version": "1.2.3", "author": "Turnix"}),
        );

        let roots = RootsService::build(crate::packs::roots::RootsOptions {
            repo_root: repo.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let found = discover_packs(&roots, false);
        let foo: Vec<_> = found.iter().filter(|d| d.pack_tree_id == "foo").collect();
        assert_eq!(foo.len(), 2);
        // Saves scanned first
        assert_eq!(found[0].layer, LayerKind::Saves);
        // Nested pack was not discovered
        assert!(!found.iter().any(|d| d.pack_tree_id == "nested"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loops_do_not_recurse() {
        let repo = tempfile::tempdir().unwrap();
        for name in crate::packs::roots::REQUIRED_SUBDIRS {
            std::fs::create_dir_all(repo.path().join(name)).unwrap();
        }
        let dir = repo.path().join("first-party").join("loopy");
        std::fs::create_dir_all(&dir).unwrap();
        std::os::unix::fs::symlink(&dir, dir.join("self")).unwrap();

        let roots = RootsService::build(crate::packs::roots::RootsOptions {
            repo_root: repo.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        // With symlinks enabled the loop must terminate; with them disabled
        // the link is skipped outright.
        let found = discover_packs(&roots, true);
        assert!(found.is_empty());
        let found = discover_packs(&roots, false);
        assert!(found.is_empty());
    }
}
