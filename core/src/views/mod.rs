//! Views: per-client UI projections.

mod registry;
mod view;

pub use registry::ViewRegistry;
pub use view::{View, ViewSnapshot};
