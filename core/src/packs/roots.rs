//! Content roots: where packs live on disk.
//!
//! A "root" is a base directory with five canonical subdirectories. Roots are
//! assembled in decreasing priority: CLI `--root` (created on demand), the
//! `TURNIX_ROOT` environment variable, OS user directories (only when they
//! already exist), then the repository root, which must carry all five
//! subdirectories or startup is refused.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, TurnixError};
use crate::packs::LayerKind;

pub const REQUIRED_SUBDIRS: [&str; 5] =
    ["first-party", "third-party", "custom", "userdata", "saves"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    FirstParty,
    ThirdParty,
    Custom,
    Userdata,
    Saves,
}

impl RootKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            RootKind::FirstParty => "first-party",
            RootKind::ThirdParty => "third-party",
            RootKind::Custom => "custom",
            RootKind::Userdata => "userdata",
            RootKind::Saves => "saves",
        }
    }
}

/// One root base with its canonical subdirectories. Subdirectory existence is
/// not guaranteed except for the repo root (validated at build).
#[derive(Debug, Clone)]
pub struct RootSet {
    pub base: PathBuf,
    pub priority: i32,
    pub label: String,
}

impl RootSet {
    pub fn subdir(&self, kind: RootKind) -> PathBuf {
        self.base.join(kind.dir_name())
    }
}

fn declare_root(base: &Path, priority: i32, label: &str, create: bool) -> Result<RootSet> {
    let base = base.to_path_buf();
    if create {
        for name in REQUIRED_SUBDIRS {
            std::fs::create_dir_all(base.join(name))?;
        }
    }
    Ok(RootSet {
        base,
        priority,
        label: label.to_string(),
    })
}

fn has_all_subdirs(base: &Path) -> bool {
    REQUIRED_SUBDIRS.iter().all(|name| base.join(name).is_dir())
}

fn dedupe_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for path in paths {
        let canon = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !out
            .iter()
            .any(|p| p.canonicalize().unwrap_or_else(|_| p.clone()) == canon)
        {
            out.push(path);
        }
    }
    out
}

/// Options for [`RootsService::build`].
#[derive(Debug, Clone, Default)]
pub struct RootsOptions {
    pub cli_root: Option<PathBuf>,
    pub cli_userdata: Option<PathBuf>,
    pub cli_saves: Option<PathBuf>,
    /// The repository root; must contain all five subdirectories.
    pub repo_root: PathBuf,
}

/// Centralized roots + read/write resolution.
#[derive(Debug)]
pub struct RootsService {
    roots: Vec<RootSet>,
    cli_userdata: Option<PathBuf>,
    cli_saves: Option<PathBuf>,
    preferred_userdata_base: parking_lot::Mutex<Option<PathBuf>>,
    preferred_saves_base: parking_lot::Mutex<Option<PathBuf>>,
}

impl RootsService {
    pub fn build(options: RootsOptions) -> Result<Self> {
        let mut roots: Vec<RootSet> = Vec::new();

        // 1) CLI --root (created with all subdirectories)
        if let Some(cli_root) = &options.cli_root {
            roots.push(declare_root(cli_root, 1000, "cli", true)?);
        }

        // 2) env TURNIX_ROOT (only when the base exists)
        if let Ok(env_root) = std::env::var("TURNIX_ROOT") {
            if !env_root.trim().is_empty() {
                let base = PathBuf::from(env_root);
                if base.exists() {
                    roots.push(declare_root(&base, 900, "env", false)?);
                }
            }
        }

        // 3) OS user dirs (only when present)
        for (base, priority, label) in user_root_candidates() {
            if base.exists() {
                roots.push(declare_root(&base, priority, label, false)?);
            }
        }

        // 4) Repo root, last; all five subdirectories or refuse to start
        if !has_all_subdirs(&options.repo_root) {
            return Err(TurnixError::Fatal {
                message: format!(
                    "repository root '{}' is missing required subdirectories ({})",
                    options.repo_root.display(),
                    REQUIRED_SUBDIRS.join(", ")
                ),
            });
        }
        roots.push(declare_root(&options.repo_root, 100, "repo", false)?);

        roots.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.base.cmp(&b.base))
        });

        debug!(
            roots = roots.len(),
            labels = ?roots.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(),
            "content roots assembled"
        );

        Ok(Self {
            roots,
            cli_userdata: options.cli_userdata,
            cli_saves: options.cli_saves,
            preferred_userdata_base: parking_lot::Mutex::new(None),
            preferred_saves_base: parking_lot::Mutex::new(None),
        })
    }

    pub fn roots(&self) -> &[RootSet] {
        &self.roots
    }

    /// UI/config-selected write base (the directory that contains the
    /// subdirectory, not the subdirectory itself).
    pub fn set_preferred_write_base(&self, kind: RootKind, base: Option<PathBuf>) {
        match kind {
            RootKind::Userdata => *self.preferred_userdata_base.lock() = base,
            RootKind::Saves => *self.preferred_saves_base.lock() = base,
            _ => {}
        }
    }

    /// Reading list for one kind: CLI override first, then every root's
    /// subdir, existing directories only, deduplicated in priority order.
    pub fn roots_for(&self, kind: RootKind) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        match kind {
            RootKind::Userdata => {
                if let Some(dir) = &self.cli_userdata {
                    if dir.exists() {
                        out.push(dir.clone());
                    }
                }
            }
            RootKind::Saves => {
                if let Some(dir) = &self.cli_saves {
                    if dir.exists() {
                        out.push(dir.clone());
                    }
                }
            }
            _ => {}
        }
        for root in &self.roots {
            let sub = root.subdir(kind);
            if sub.exists() {
                out.push(sub);
            }
        }
        dedupe_paths(out)
    }

    /// Content-hosting roots with their layer tags, existing-only, in
    /// priority order.
    pub fn content_roots(&self) -> Vec<(PathBuf, LayerKind)> {
        let mut out: Vec<(PathBuf, LayerKind)> = Vec::new();
        for root in &self.roots {
            for (kind, layer) in [
                (RootKind::FirstParty, LayerKind::FirstParty),
                (RootKind::ThirdParty, LayerKind::ThirdParty),
                (RootKind::Custom, LayerKind::Custom),
            ] {
                let sub = root.subdir(kind);
                if sub.exists() && !out.iter().any(|(p, _)| p == &sub) {
                    out.push((sub, layer));
                }
            }
        }
        out
    }

    /// Save-hosting roots (scanned before content roots so their candidates
    /// win resolution ties).
    pub fn save_roots(&self) -> Vec<PathBuf> {
        self.roots_for(RootKind::Saves)
    }

    /// The directory writes for `kind` land in, created if missing:
    /// CLI override > preferred base > repo root subdir.
    pub fn write_dir(&self, kind: RootKind) -> Result<PathBuf> {
        let cli = match kind {
            RootKind::Userdata => self.cli_userdata.clone(),
            RootKind::Saves => self.cli_saves.clone(),
            _ => None,
        };
        if let Some(dir) = cli {
            std::fs::create_dir_all(&dir)?;
            return Ok(dir);
        }

        let preferred = match kind {
            RootKind::Userdata => self.preferred_userdata_base.lock().clone(),
            RootKind::Saves => self.preferred_saves_base.lock().clone(),
            _ => None,
        };
        if let Some(base) = preferred {
            let sub = base.join(kind.dir_name());
            std::fs::create_dir_all(&sub)?;
            return Ok(sub);
        }

        let repo = self
            .roots
            .iter()
            .find(|r| r.label == "repo")
            .ok_or_else(|| TurnixError::Fatal {
                message: "repo root not found among content roots".to_string(),
            })?;
        let sub = repo.subdir(kind);
        std::fs::create_dir_all(&sub)?;
        Ok(sub)
    }
}

/// Platform-specific user root candidates, highest priority first.
fn user_root_candidates() -> Vec<(PathBuf, i32, &'static str)> {
    let mut out = Vec::new();
    if cfg!(windows) {
        let docs = std::env::var("USERPROFILE")
            .map(|p| PathBuf::from(p).join("Documents"))
            .ok()
            .filter(|p| p.exists())
            .or_else(|| dirs::document_dir());
        if let Some(docs) = docs {
            out.push((docs.join("My Games").join("Turnix"), 800, "my-games"));
        }
        if let Ok(roaming) = std::env::var("APPDATA") {
            out.push((PathBuf::from(roaming).join("Turnix"), 700, "appdata"));
        }
    } else {
        let data_base = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .map(|p| p.join("turnix"));
        if let Some(base) = data_base {
            out.push((base, 800, "xdg-data"));
        }
        let config_base = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .map(|p| p.join("turnix"));
        if let Some(base) = config_base {
            out.push((base, 700, "xdg-config"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with_subdirs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in REQUIRED_SUBDIRS {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn repo_missing_subdirs_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = RootsService::build(RootsOptions {
            repo_root: dir.path().to_path_buf(),
            ..RootsOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, TurnixError::Fatal { .. }));
    }

    #[test]
    fn cli_root_is_created_and_wins_priority() {
        let repo = repo_with_subdirs();
        let cli = tempfile::tempdir().unwrap();
        let cli_base = cli.path().join("myroot");

        let service = RootsService::build(RootsOptions {
            cli_root: Some(cli_base.clone()),
            repo_root: repo.path().to_path_buf(),
            ..RootsOptions::default()
        })
        .unwrap();

        assert!(cli_base.join("first-party").is_dir());
        assert_eq!(service.roots()[0].label, "cli");
        // CLI root's subdirs come before the repo's in the read list
        let saves = service.roots_for(RootKind::Saves);
        assert_eq!(saves[0], cli_base.join("saves"));
    }

    #[test]
    fn cli_saves_override_forces_write_dir() {
        let repo = repo_with_subdirs();
        let saves = tempfile::tempdir().unwrap();
        let forced = saves.path().join("forced-saves");

        let service = RootsService::build(RootsOptions {
            cli_saves: Some(forced.clone()),
            repo_root: repo.path().to_path_buf(),
            ..RootsOptions::default()
        })
        .unwrap();

        let dir = service.write_dir(RootKind::Saves).unwrap();
        assert_eq!(dir, forced);
        assert!(forced.is_dir());
    }

    #[test]
    fn default_write_dir_is_repo_subdir() {
        let repo = repo_with_subdirs();
        let service = RootsService::build(RootsOptions {
            repo_root: repo.path().to_path_buf(),
            ..RootsOptions::default()
        })
        .unwrap();
        let dir = service.write_dir(RootKind::Userdata).unwrap();
        assert_eq!(dir, repo.path().join("userdata"));
    }

    #[test]
    fn content_roots_carry_layer_tags() {
        let repo = repo_with_subdirs();
        let service = RootsService::build(RootsOptions {
            repo_root: repo.path().to_path_buf(),
            ..RootsOptions::default()
        })
        .unwrap();
        let roots = service.content_roots();
        let layers: Vec<LayerKind> = roots.iter().map(|(_, l)| *l).collect();
        assert!(layers.contains(&LayerKind::FirstParty));
        assert!(layers.contains(&LayerKind::ThirdParty));
        assert!(layers.contains(&LayerKind::Custom));
    }
}
