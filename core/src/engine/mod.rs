//! The engine context: one struct carrying every service, threaded
//! explicitly through handlers instead of process globals.

mod capabilities;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Result, TurnixError};
use crate::llm::HttpEngineCaller;
use crate::app::AppInstance;
use crate::memory::{DictLayer, MemoryLayer, ReadOnlyLayer};
use crate::packs::{
    discover_packs, parse_pack_ref, resolve_pack_selector, PackDescriptor, PackKind,
    PackPlanner, PackRegistry, RootsService,
};
use crate::permissions::{Grant, PermissionManager};
use crate::rpc::{CapabilityRouter, ConnectionTable, TransportCtx};
use crate::semver::Requirement;
use crate::sessions::Session;
use crate::trace::{TraceContext, TraceHub, Tracer};
use crate::views::ViewRegistry;

pub const DEFAULT_APP_SELECTOR: &str = "main-menu";

/// Principals that ship with the engine.
const SEED_PRINCIPALS: [&str; 2] = ["system", "unknown"];
/// Built-in capability families and their baselines.
const BUILTIN_FAMILIES: [(&str, &str); 4] = [
    ("chat@^1", "low"),
    ("view.state@^1", "low"),
    ("packs.index@^1", "low"),
    ("trace.stream@^1", "medium"),
];

/// Root service graph. Constructed once in `main`; every capability and
/// handler receives it (or a slice of it) via context.
pub struct Engine {
    pub settings: Arc<Settings>,
    pub roots: Arc<RootsService>,
    pub permissions: Arc<PermissionManager>,
    pub capabilities: Arc<CapabilityRouter>,
    pub views: Arc<ViewRegistry>,
    pub connections: Arc<ConnectionTable>,
    pub trace_hub: Arc<TraceHub>,
    pub tracer: Tracer,

    packs: Mutex<Arc<PackRegistry>>,
    kernel_layers: Vec<Arc<dyn MemoryLayer>>,
    active_instance: Mutex<Option<Arc<AppInstance>>>,
}

impl Engine {
    pub fn new(settings: Settings, roots: RootsService) -> Arc<Engine> {
        let trace_hub = Arc::new(TraceHub::new(
            settings.trace.buffer_capacity,
            settings.trace.subscriber_queue,
        ));
        let tracer = Tracer::new(trace_hub.clone());

        // Kernel-level bottom layers every runtime inherits.
        let kernel_layers: Vec<Arc<dyn MemoryLayer>> = vec![
            Arc::new(DictLayer::new(
                "kernelRuntime",
                settings.memory.max_versions_per_key,
            )),
            Arc::new(ReadOnlyLayer::new("kernelStatic", HashMap::new())),
        ];

        Arc::new(Engine {
            settings: Arc::new(settings),
            roots: Arc::new(roots),
            permissions: Arc::new(PermissionManager::new()),
            capabilities: Arc::new(CapabilityRouter::new()),
            views: Arc::new(ViewRegistry::new("turnix@main-menu")),
            connections: Arc::new(ConnectionTable::new()),
            trace_hub,
            tracer,
            packs: Mutex::new(Arc::new(PackRegistry::default())),
            kernel_layers,
            active_instance: Mutex::new(None),
        })
    }

    // ----- Packs -----

    /// Run discovery over all roots and swap in a fresh registry.
    pub fn rescan_packs(&self) -> Result<usize> {
        let descriptors = discover_packs(&self.roots, self.settings.roots.follow_symlinks);
        let count = descriptors.len();
        let registry = PackRegistry::new(descriptors)?;
        *self.packs.lock() = Arc::new(registry);
        self.tracer.event(
            "packs.scan.done",
            "info",
            &["packs"],
            None,
            &TraceContext::new(),
            Some(serde_json::Map::from_iter([(
                "packCount".to_string(),
                json!(count),
            )])),
        );
        info!(packs = count, "pack discovery finished");
        Ok(count)
    }

    pub fn packs(&self) -> Arc<PackRegistry> {
        self.packs.lock().clone()
    }

    pub fn resolve_app_pack(&self, selector: &str) -> Result<Arc<PackDescriptor>> {
        let request = parse_pack_ref(selector, Some(PackKind::App))?;
        resolve_pack_selector(&self.packs(), &request, None, None, true)
    }

    // ----- App mounting -----

    /// Resolve an app pack, build its activation plan, and mount an
    /// AppInstance with a main session wired to the LLM driver.
    pub fn mount_app(self: &Arc<Self>, selector: &str) -> Result<Arc<AppInstance>> {
        let app = self.resolve_app_pack(selector)?;
        let registry = self.packs();
        let planner = PackPlanner::new(&registry);
        let plan = planner.build_plan_for_roots(vec![app.clone()])?;

        let app_pack_id = format!("{}@{}", app.effective_author, app.pack_tree_id);
        let save_base = self.roots.write_dir(crate::packs::RootKind::Saves)?;
        let instance = AppInstance::new(
            &app_pack_id,
            None,
            &save_base,
            self.kernel_layers.clone(),
            self.settings.memory.clone(),
            self.tracer.clone(),
            true,
        )?;

        let allowed: HashSet<String> = plan
            .entries
            .iter()
            .map(|entry| entry.descriptor.pack_tree_id.clone())
            .collect();
        instance.set_allowed_packs(allowed);

        if let Some(main) = instance.main_session() {
            main.pipeline()
                .set_engine_caller(HttpEngineCaller::shared(self.settings.llm.clone()));
        }

        self.tracer.event(
            "app.mounted",
            "info",
            &["app"],
            None,
            &TraceContext::new()
                .with("appPackId", app_pack_id.clone())
                .with("appInstanceId", instance.id.clone()),
            Some(serde_json::Map::from_iter([(
                "planEntries".to_string(),
                json!(plan.entries.len()),
            )])),
        );

        *self.active_instance.lock() = Some(instance.clone());
        Ok(instance)
    }

    pub fn active_instance(&self) -> Option<Arc<AppInstance>> {
        self.active_instance.lock().clone()
    }

    pub fn main_session(&self) -> Option<Arc<Session>> {
        self.active_instance().and_then(|i| i.main_session())
    }

    // ----- Boot -----

    /// Full startup: discovery, app mount (falling back to an instance-less
    /// engine when the selector resolves nothing), capability + grant
    /// seeding.
    pub fn boot(self: &Arc<Self>, app_selector: &str) -> Result<()> {
        self.rescan_packs()?;
        match self.mount_app(app_selector) {
            Ok(instance) => {
                info!(app_instance_id = instance.id, "app instance mounted");
            }
            Err(TurnixError::PackNotFound { selector }) => {
                warn!(selector, "no app pack resolved; running without an instance");
            }
            Err(err) => return Err(err),
        }
        self.register_builtin_capabilities()?;
        self.seed_grants();
        Ok(())
    }

    pub fn register_builtin_capabilities(self: &Arc<Self>) -> Result<()> {
        capabilities::register_all(self)?;
        for (capability, risk) in BUILTIN_FAMILIES {
            self.permissions.register_capability(capability, risk)?;
        }
        Ok(())
    }

    /// Baseline allow-grants for the engine's own principals. The
    /// grant-prompting UX for third-party mods lives outside the core.
    pub fn seed_grants(&self) {
        for principal in SEED_PRINCIPALS {
            for (capability, _risk) in BUILTIN_FAMILIES {
                let family = capability.split('@').next().unwrap_or(capability);
                self.permissions.put_grant(Grant::allow(
                    principal,
                    family,
                    Requirement::parse("*").unwrap_or(None),
                ));
            }
        }
    }

    // ----- Mods over HTTP -----

    /// Frontend mod index for a view: the mod packs the active instance
    /// allows (all discovered mods when no instance is mounted).
    pub fn mods_index(&self, _view_id: &str) -> Value {
        let registry = self.packs();
        let allowed = self.active_instance().map(|i| i.allowed_packs());
        let mut manifests: Vec<Value> = Vec::new();
        for desc in registry.all() {
            if desc.kind != PackKind::Mod {
                continue;
            }
            if let Some(allowed) = &allowed {
                if !allowed.contains(&desc.pack_tree_id) {
                    continue;
                }
            }
            manifests.push(json!({
                "id": desc.pack_tree_id,
                "name": desc.name,
                "version": desc.effective_version.as_ref().map(|v| v.to_string()),
                "author": desc.effective_author,
                "layer": desc.layer.as_str(),
                "manifest": desc.raw,
            }));
        }
        json!({
            "modManifests": manifests,
            "meta": {"count": manifests.len(), "errors": 0},
        })
    }

    /// Resolve a file inside a mod pack, refusing paths that escape the pack
    /// root.
    pub fn mod_file_path(&self, mod_id: &str, rel_path: &str) -> Result<std::path::PathBuf> {
        let registry = self.packs();
        let desc = registry
            .resolve_best(mod_id, Some(PackKind::Mod), None, None, true)
            .ok_or_else(|| TurnixError::PackNotFound {
                selector: mod_id.to_string(),
            })?;
        let candidate = desc.pack_root.join(rel_path);
        let resolved = candidate
            .canonicalize()
            .map_err(|_| TurnixError::bad_request(format!("no such mod file: {rel_path}")))?;
        let pack_root = desc
            .pack_root
            .canonicalize()
            .unwrap_or_else(|_| desc.pack_root.clone());
        if !resolved.starts_with(&pack_root) {
            return Err(TurnixError::bad_request("path escapes the pack root"));
        }
        Ok(resolved)
    }

    // ----- Transport wiring -----

    pub fn transport_ctx(self: &Arc<Self>) -> Arc<TransportCtx> {
        let engine = Arc::downgrade(self);
        Arc::new(TransportCtx {
            settings: self.settings.clone(),
            views: self.views.clone(),
            permissions: self.permissions.clone(),
            capabilities: self.capabilities.clone(),
            connections: self.connections.clone(),
            session_provider: Box::new(move || {
                engine.upgrade().and_then(|engine| engine.main_session())
            }),
        })
    }

    /// Graceful teardown: unmount the active instance and flush memory.
    pub async fn shutdown(&self) {
        let instance = self.active_instance.lock().take();
        if let Some(instance) = instance {
            if let Some(main) = instance.main_session() {
                main.flush_memory();
            }
            instance.destroy().await;
        }
    }
}

/// Build a RootsService from CLI arguments, defaulting the repo root to the
/// working directory.
pub fn build_roots(
    cli_root: Option<&Path>,
    cli_userdata: Option<&Path>,
    cli_saves: Option<&Path>,
    repo_root: &Path,
) -> Result<RootsService> {
    RootsService::build(crate::packs::RootsOptions {
        cli_root: cli_root.map(|p| p.to_path_buf()),
        cli_userdata: cli_userdata.map(|p| p.to_path_buf()),
        cli_saves: cli_saves.map(|p| p.to_path_buf()),
        repo_root: repo_root.to_path_buf(),
    })
}
