use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::semver::{Requirement, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackKind {
    #[serde(rename = "appPack")]
    App,
    #[serde(rename = "viewPack")]
    View,
    #[serde(rename = "mod")]
    Mod,
    #[serde(rename = "contentPack")]
    Content,
    #[serde(rename = "savePack")]
    Save,
}

impl PackKind {
    pub fn parse(raw: &str) -> Option<PackKind> {
        match raw {
            "appPack" => Some(PackKind::App),
            "viewPack" => Some(PackKind::View),
            "mod" => Some(PackKind::Mod),
            "contentPack" => Some(PackKind::Content),
            "savePack" => Some(PackKind::Save),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackKind::App => "appPack",
            PackKind::View => "viewPack",
            PackKind::Mod => "mod",
            PackKind::Content => "contentPack",
            PackKind::Save => "savePack",
        }
    }
}

/// Which slice of a root a pack was discovered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKind {
    FirstParty,
    ThirdParty,
    Custom,
    Saves,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::FirstParty => "first-party",
            LayerKind::ThirdParty => "third-party",
            LayerKind::Custom => "custom",
            LayerKind::Saves => "saves",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityKind {
    Public,
    Private,
}

/// A parsed selector: what a pack (or a caller) asks for.
#[derive(Debug, Clone)]
pub struct PackRequest {
    /// From the `<author>@` prefix of a PackRefString; None when omitted.
    pub author: Option<String>,
    /// Hierarchical id, e.g. "ui.trace.trace-view".
    pub pack_tree_id: String,
    /// Parsed version constraint, None for "any".
    pub requirement: Option<Requirement>,
    /// Optional pack-kind filter.
    pub kind: Option<PackKind>,
}

/// Canonical, immutable description of a single discovered pack.
///
/// Built once during discovery; resolution works only on these descriptors,
/// never on the filesystem.
#[derive(Debug, Clone)]
pub struct PackDescriptor {
    // Identity / hierarchy
    pub local_id: String,
    pub pack_tree_id: String,
    pub kind: PackKind,

    // Author + version (declared vs effective)
    pub declared_author: Option<String>,
    pub declared_version: Option<Version>,
    pub effective_author: String,
    pub effective_version: Option<Version>,

    // Location and layer
    pub layer: LayerKind,
    pub base_root: PathBuf,
    pub pack_root: PathBuf,
    pub manifest_path: PathBuf,

    // Visibility / inheritance
    pub visibility: VisibilityKind,
    pub import_from_parent: bool,

    // Dependencies (normalized at discovery)
    pub dependencies: Vec<PackRequest>,
    pub recommended: Vec<PackRequest>,

    // Runtime entries, e.g. "javascript" -> ["ui.js"]
    pub runtime_entries: std::collections::BTreeMap<String, Vec<String>>,

    // UI metadata
    pub name: String,
    pub description: Option<String>,

    /// Full raw manifest object.
    pub raw: serde_json::Value,
}

impl PackDescriptor {
    /// Human-readable identity for logs and duplicate errors.
    pub fn identity(&self) -> String {
        let version = self
            .effective_version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unversioned".to_string());
        format!(
            "{}@{}:{} in layer {}",
            self.effective_author,
            self.pack_tree_id,
            version,
            self.layer.as_str()
        )
    }
}
