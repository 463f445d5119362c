//! PackRefString parsing and selector resolution.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TurnixError};
use crate::packs::{PackDescriptor, PackKind, PackRegistry, PackRequest};
use crate::semver::Requirement;

fn strip_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse a textual selector into a PackRequest.
///
/// Grammar (no scheme):
///
///   [<author>"@"]<packTreeId>["@"<requirement>]
///
/// Examples:
///   "avatars"                      id only
///   "Anthony@avatars"              author + id
///   "Turnix@ui.trace-list@2.5.3"   author + id + requirement
///   "main-menu@2.3.4"              id + requirement
///
/// Strings containing "://" are full URIs and are rejected here.
pub fn parse_pack_ref(reference: &str, kind: Option<PackKind>) -> Result<PackRequest> {
    let invalid = |message: String| TurnixError::InvalidSelector {
        selector: reference.to_string(),
        message,
    };

    let text = reference.trim();
    if text.is_empty() {
        return Err(invalid("empty selector".into()));
    }
    if text.contains("://") {
        return Err(invalid("looks like a full URI; scheme selectors are handled elsewhere".into()));
    }

    let parts: Vec<&str> = text.split('@').collect();
    let (author, pack_tree_id, requirement) = match parts.as_slice() {
        [id] => (None, strip_or_none(id), None),
        [first, second] => {
            // author@packTreeId OR packTreeId@requirement; a parseable
            // requirement in the second segment decides.
            match Requirement::parse(second) {
                Ok(Some(req)) => (None, strip_or_none(first), Some(req)),
                _ => (strip_or_none(first), strip_or_none(second), None),
            }
        }
        [author, id, req] => {
            let requirement = match strip_or_none(req) {
                Some(raw) => Requirement::parse(&raw)?,
                None => None,
            };
            (strip_or_none(author), strip_or_none(id), requirement)
        }
        _ => {
            return Err(invalid(
                "too many '@' segments (expected at most author@id@range)".into(),
            ))
        }
    };

    let pack_tree_id = pack_tree_id.ok_or_else(|| invalid("missing packTreeId".into()))?;

    Ok(PackRequest {
        author,
        pack_tree_id,
        requirement,
        kind,
    })
}

fn pick_author_for_lookup(
    request: &PackRequest,
    requesting_pack: Option<&PackDescriptor>,
) -> Option<String> {
    if request.author.is_some() {
        return request.author.clone();
    }
    requesting_pack.map(|pack| pack.effective_author.clone())
}

fn ensure_no_author_ambiguity(
    registry: &PackRegistry,
    pack_tree_id: &str,
    kind: Option<PackKind>,
    author: Option<&str>,
    selector: &str,
) -> Result<()> {
    if author.is_some() {
        return Ok(());
    }
    let candidates = registry.find_candidates(pack_tree_id, kind, None);
    let authors: BTreeSet<String> = candidates
        .iter()
        .map(|desc| desc.effective_author.clone())
        .collect();
    if authors.len() > 1 {
        return Err(TurnixError::AmbiguousSelector {
            selector: selector.to_string(),
            authors: authors.into_iter().collect(),
        });
    }
    Ok(())
}

/// Resolve a PackRefString or a pre-parsed PackRequest to a concrete
/// descriptor.
///
/// - The selector's own requirement is used unless `requirement_override` is
///   given.
/// - An omitted author inherits `requesting_pack`'s effective author; if it
///   stays unset and multiple authors exist, the selector is ambiguous.
pub fn resolve_pack_selector(
    registry: &PackRegistry,
    request: &PackRequest,
    requesting_pack: Option<&PackDescriptor>,
    requirement_override: Option<&Requirement>,
    prefer_saves: bool,
) -> Result<Arc<PackDescriptor>> {
    let author = pick_author_for_lookup(request, requesting_pack);
    let requirement = requirement_override.or(request.requirement.as_ref());
    let selector_text = match &author {
        Some(author) => format!("{author}@{}", request.pack_tree_id),
        None => request.pack_tree_id.clone(),
    };

    ensure_no_author_ambiguity(
        registry,
        &request.pack_tree_id,
        request.kind,
        author.as_deref(),
        &selector_text,
    )?;

    registry
        .resolve_best(
            &request.pack_tree_id,
            request.kind,
            author.as_deref(),
            requirement,
            prefer_saves,
        )
        .ok_or_else(|| TurnixError::PackNotFound {
            selector: selector_text,
        })
}

/// Best-effort wrapper: `None` when nothing matched. Real ambiguity still
/// propagates so callers must handle it explicitly.
pub fn try_resolve_pack_selector(
    registry: &PackRegistry,
    request: &PackRequest,
    requesting_pack: Option<&PackDescriptor>,
    prefer_saves: bool,
) -> Result<Option<Arc<PackDescriptor>>> {
    match resolve_pack_selector(registry, request, requesting_pack, None, prefer_saves) {
        Ok(desc) => Ok(Some(desc)),
        Err(TurnixError::PackNotFound { selector }) => {
            debug!(selector, "pack selector did not resolve");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_selector_forms() {
        let req = parse_pack_ref("avatars", None).unwrap();
        assert_eq!(req.pack_tree_id, "avatars");
        assert!(req.author.is_none());
        assert!(req.requirement.is_none());

        let req = parse_pack_ref("Anthony@avatars", None).unwrap();
        assert_eq!(req.author.as_deref(), Some("Anthony"));
        assert_eq!(req.pack_tree_id, "avatars");

        let req = parse_pack_ref("main-menu@2.3.4", None).unwrap();
        assert!(req.author.is_none());
        assert_eq!(req.pack_tree_id, "main-menu");
        assert!(req.requirement.is_some());

        let req = parse_pack_ref("Turnix@ui.trace-list@^3", Some(PackKind::Mod)).unwrap();
        assert_eq!(req.author.as_deref(), Some("Turnix"));
        assert_eq!(req.pack_tree_id, "ui.trace-list");
        assert!(req.requirement.is_some());
        assert_eq!(req.kind, Some(PackKind::Mod));
    }

    #[test]
    fn rejects_uris_and_extra_segments() {
        assert!(parse_pack_ref("mod://foo/bar", None).is_err());
        assert!(parse_pack_ref("a@b@c@d", None).is_err());
        assert!(parse_pack_ref("", None).is_err());
        assert!(parse_pack_ref("   ", None).is_err());
    }

    #[test]
    fn ambiguous_author_errors() {
        use crate::packs::registry::tests_support::mod_desc;
        let registry = PackRegistry::new([
            mod_desc("foo", "Alice", Some("1.0.0")),
            mod_desc("foo", "Bob", Some("1.0.0")),
        ])
        .unwrap();
        let request = parse_pack_ref("foo", Some(PackKind::Mod)).unwrap();
        let err = resolve_pack_selector(&registry, &request, None, None, true).unwrap_err();
        assert!(matches!(err, TurnixError::AmbiguousSelector { .. }));

        // Explicit author resolves fine
        let request = parse_pack_ref("Alice@foo", Some(PackKind::Mod)).unwrap();
        let desc = resolve_pack_selector(&registry, &request, None, None, true).unwrap();
        assert_eq!(desc.effective_author, "Alice");
    }

    #[test]
    fn requesting_pack_author_is_inherited() {
        use crate::packs::registry::tests_support::mod_desc;
        let registry = PackRegistry::new([
            mod_desc("foo", "Alice", Some("1.0.0")),
            mod_desc("foo", "Bob", Some("2.0.0")),
        ])
        .unwrap();
        let requester = mod_desc("bar", "Bob", Some("1.0.0"));
        let request = parse_pack_ref("foo", Some(PackKind::Mod)).unwrap();
        let desc =
            resolve_pack_selector(&registry, &request, Some(&requester), None, true).unwrap();
        assert_eq!(desc.effective_author, "Bob");
    }

    #[test]
    fn try_resolve_swallows_not_found_only() {
        use crate::packs::registry::tests_support::mod_desc;
        let registry = PackRegistry::new([
            mod_desc("foo", "Alice", Some("1.0.0")),
            mod_desc("foo", "Bob", Some("1.0.0")),
        ])
        .unwrap();
        let missing = parse_pack_ref("nope", Some(PackKind::Mod)).unwrap();
        assert!(try_resolve_pack_selector(&registry, &missing, None, true)
            .unwrap()
            .is_none());
        let ambiguous = parse_pack_ref("foo", Some(PackKind::Mod)).unwrap();
        assert!(try_resolve_pack_selector(&registry, &ambiguous, None, true).is_err());
    }
}
