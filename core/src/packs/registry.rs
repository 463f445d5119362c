//! In-memory index of all discovered packs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TurnixError};
use crate::packs::{LayerKind, PackDescriptor, PackKind};
use crate::semver::{best_match, Requirement, Version};

/// Holds descriptors from discovery and answers semver-based resolution.
/// Save-layer packs are preferred over content-layer packs on version ties.
#[derive(Default)]
pub struct PackRegistry {
    by_tree_id: HashMap<String, Vec<Arc<PackDescriptor>>>,
    all: Vec<Arc<PackDescriptor>>,
}

impl PackRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = PackDescriptor>) -> Result<Self> {
        let mut registry = Self::default();
        for desc in descriptors {
            registry.register(desc)?;
        }
        Ok(registry)
    }

    /// Index a descriptor. An exact duplicate of the full identity tuple
    /// within the same layer is rejected.
    pub fn register(&mut self, desc: PackDescriptor) -> Result<()> {
        if let Some(existing) = self.by_tree_id.get(&desc.pack_tree_id) {
            for other in existing {
                if other.kind == desc.kind
                    && other.effective_author == desc.effective_author
                    && other.effective_version == desc.effective_version
                    && other.layer == desc.layer
                {
                    return Err(TurnixError::DuplicateDescriptor {
                        identity: desc.identity(),
                    });
                }
            }
        }
        let desc = Arc::new(desc);
        self.by_tree_id
            .entry(desc.pack_tree_id.clone())
            .or_default()
            .push(desc.clone());
        self.all.push(desc);
        Ok(())
    }

    pub fn all(&self) -> &[Arc<PackDescriptor>] {
        &self.all
    }

    pub fn find_by_tree_id(&self, pack_tree_id: &str) -> Vec<Arc<PackDescriptor>> {
        self.by_tree_id
            .get(pack_tree_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All descriptors matching the tree id, optionally filtered by kind and
    /// effective author.
    pub fn find_candidates(
        &self,
        pack_tree_id: &str,
        kind: Option<PackKind>,
        author: Option<&str>,
    ) -> Vec<Arc<PackDescriptor>> {
        let Some(candidates) = self.by_tree_id.get(pack_tree_id) else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|desc| kind.map_or(true, |k| desc.kind == k))
            .filter(|desc| author.map_or(true, |a| desc.effective_author == a))
            .cloned()
            .collect()
    }

    /// Resolve the best pack for `(pack_tree_id[, kind][, author])` under an
    /// optional requirement.
    ///
    /// - No candidates: None.
    /// - A requirement but no versioned candidates: None (cannot be proven).
    /// - No requirement and no versioned candidates: first candidate after
    ///   layer ordering.
    /// - Otherwise semver best-match, with input order preserving the layer
    ///   preference on ties.
    pub fn resolve_best(
        &self,
        pack_tree_id: &str,
        kind: Option<PackKind>,
        author: Option<&str>,
        requirement: Option<&Requirement>,
        prefer_saves: bool,
    ) -> Option<Arc<PackDescriptor>> {
        let mut candidates = self.find_candidates(pack_tree_id, kind, author);
        if candidates.is_empty() {
            return None;
        }

        if prefer_saves {
            candidates.sort_by(|a, b| {
                (a.layer != LayerKind::Saves)
                    .cmp(&(b.layer != LayerKind::Saves))
                    .then_with(|| a.base_root.cmp(&b.base_root))
                    .then_with(|| a.pack_root.cmp(&b.pack_root))
            });
        } else {
            candidates.sort_by(|a, b| {
                a.base_root
                    .cmp(&b.base_root)
                    .then_with(|| a.pack_root.cmp(&b.pack_root))
            });
        }

        let versioned: Vec<(Version, Arc<PackDescriptor>)> = candidates
            .iter()
            .filter_map(|desc| {
                desc.effective_version
                    .clone()
                    .map(|v| (v, desc.clone()))
            })
            .collect();

        if versioned.is_empty() {
            if requirement.is_some() {
                return None;
            }
            return candidates.into_iter().next();
        }

        best_match(&versioned, requirement).map(|(_, desc)| desc)
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::packs::VisibilityKind;
    use std::path::PathBuf;

    /// A first-party mod descriptor for selector/plan tests.
    pub(crate) fn mod_desc(
        tree_id: &str,
        author: &str,
        version: Option<&str>,
    ) -> PackDescriptor {
        let root = format!("/packs/{author}/{tree_id}");
        PackDescriptor {
            local_id: tree_id.to_string(),
            pack_tree_id: tree_id.to_string(),
            kind: PackKind::Mod,
            declared_author: Some(author.to_string()),
            declared_version: version.map(|v| crate::semver::parse_version(v).unwrap()),
            effective_author: author.to_string(),
            effective_version: version.map(|v| crate::semver::parse_version(v).unwrap()),
            layer: LayerKind::FirstParty,
            base_root: PathBuf::from("/packs"),
            pack_root: PathBuf::from(&root),
            manifest_path: PathBuf::from(root).join("manifest.json5"),
            visibility: VisibilityKind::Private,
            import_from_parent: true,
            dependencies: Vec::new(),
            recommended: Vec::new(),
            runtime_entries: Default::default(),
            name: tree_id.to_string(),
            description: None,
            raw: serde_json::json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packs::VisibilityKind;
    use std::path::PathBuf;

    fn desc(
        tree_id: &str,
        author: &str,
        version: Option<&str>,
        layer: LayerKind,
        pack_root: &str,
    ) -> PackDescriptor {
        PackDescriptor {
            local_id: tree_id.to_string(),
            pack_tree_id: tree_id.to_string(),
            kind: PackKind::Mod,
            declared_author: Some(author.to_string()),
            declared_version: version.map(|v| crate::semver::parse_version(v).unwrap()),
            effective_author: author.to_string(),
            effective_version: version.map(|v| crate::semver::parse_version(v).unwrap()),
            layer,
            base_root: PathBuf::from("/base"),
            pack_root: PathBuf::from(pack_root),
            manifest_path: PathBuf::from(pack_root).join("manifest.json5"),
            visibility: VisibilityKind::Private,
            import_from_parent: true,
            dependencies: Vec::new(),
            recommended: Vec::new(),
            runtime_entries: Default::default(),
            name: tree_id.to_string(),
            description: None,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn duplicate_identity_in_same_layer_is_rejected() {
        let mut registry = PackRegistry::default();
        registry
            .register(desc("foo", "Turnix", Some("1.2.3"), LayerKind::FirstParty, "/a"))
            .unwrap();
        let err = registry
            .register(desc("foo", "Turnix", Some("1.2.3"), LayerKind::FirstParty, "/b"))
            .unwrap_err();
        assert!(matches!(err, TurnixError::DuplicateDescriptor { .. }));

        // Same identity in a different layer is fine
        registry
            .register(desc("foo", "Turnix", Some("1.2.3"), LayerKind::Saves, "/c"))
            .unwrap();
    }

    #[test]
    fn saves_layer_wins_version_ties() {
        let registry = PackRegistry::new([
            desc("foo", "Turnix", Some("1.2.3"), LayerKind::FirstParty, "/fp"),
            desc("foo", "Turnix", Some("1.2.3"), LayerKind::Saves, "/sv"),
        ])
        .unwrap();

        let requirement = Requirement::parse("^1.0.0").unwrap();
        let best = registry
            .resolve_best("foo", Some(PackKind::Mod), None, requirement.as_ref(), true)
            .unwrap();
        assert_eq!(best.layer, LayerKind::Saves);

        let best = registry
            .resolve_best("foo", Some(PackKind::Mod), None, requirement.as_ref(), false)
            .unwrap();
        assert_eq!(best.layer, LayerKind::FirstParty);
    }

    #[test]
    fn highest_satisfying_version_wins() {
        let registry = PackRegistry::new([
            desc("foo", "Turnix", Some("1.1.0"), LayerKind::FirstParty, "/a"),
            desc("foo", "Turnix", Some("1.9.0"), LayerKind::FirstParty, "/b"),
            desc("foo", "Turnix", Some("2.0.0"), LayerKind::FirstParty, "/c"),
        ])
        .unwrap();
        let requirement = Requirement::parse("^1.0.0").unwrap();
        let best = registry
            .resolve_best("foo", None, None, requirement.as_ref(), true)
            .unwrap();
        assert_eq!(best.effective_version.as_ref().unwrap().to_string(), "1.9.0");
    }

    #[test]
    fn requirement_with_only_unversioned_candidates_is_none() {
        let registry = PackRegistry::new([desc(
            "foo",
            "Turnix",
            None,
            LayerKind::FirstParty,
            "/a",
        )])
        .unwrap();
        let requirement = Requirement::parse("^1.0.0").unwrap();
        assert!(registry
            .resolve_best("foo", None, None, requirement.as_ref(), true)
            .is_none());
        // Without a requirement the unversioned candidate is usable
        assert!(registry.resolve_best("foo", None, None, None, true).is_some());
    }

    #[test]
    fn author_filter_applies() {
        let registry = PackRegistry::new([
            desc("foo", "Alice", Some("1.0.0"), LayerKind::FirstParty, "/a"),
            desc("foo", "Bob", Some("2.0.0"), LayerKind::FirstParty, "/b"),
        ])
        .unwrap();
        let best = registry
            .resolve_best("foo", None, Some("Alice"), None, true)
            .unwrap();
        assert_eq!(best.effective_author, "Alice");
    }
}
