//! Pack discovery and resolution.
//!
//! Content "packs" (apps, views, mods, content, saves) are discovered from a
//! priority-ordered list of filesystem roots, normalized into immutable
//! descriptors, indexed for semver resolution, and composed into activation
//! plans via dependency closure.

mod descriptor;
mod discover;
mod plan;
mod registry;
pub(crate) mod roots;
mod selector;

pub use descriptor::{
    LayerKind, PackDescriptor, PackKind, PackRequest, VisibilityKind,
};
pub use discover::{discover_packs, normalize_manifest};
pub use plan::{ActivationEntry, ActivationPlan, ActivationReason, PackPlanner};
pub use registry::PackRegistry;
pub use roots::{RootKind, RootSet, RootsOptions, RootsService};
pub use selector::{parse_pack_ref, resolve_pack_selector, try_resolve_pack_selector};
