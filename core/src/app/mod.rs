//! AppInstances: mounted, running copies of app packs.

mod instance;
mod persistence;

pub use instance::AppInstance;
pub use persistence::{load_app_instance, save_app_instance};
