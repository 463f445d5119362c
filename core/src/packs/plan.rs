//! Dependency closure and activation plans.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, TurnixError};
use crate::packs::{
    resolve_pack_selector, PackDescriptor, PackKind, PackRegistry, PackRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationReason {
    Root,
    Dependency,
    Recommended,
}

/// A single step in the activation plan.
#[derive(Debug, Clone)]
pub struct ActivationEntry {
    pub descriptor: Arc<PackDescriptor>,
    pub reason: ActivationReason,
    /// Absence or failure of a required entry is fatal for the plan.
    pub required: bool,
    /// Graph depth from the root (0 == root), recorded at first encounter.
    pub depth: usize,
}

/// Final, engine-internal representation of which packs activate in which
/// order. The plan performs no loading itself; higher layers consume it.
#[derive(Debug, Clone, Default)]
pub struct ActivationPlan {
    pub roots: Vec<Arc<PackDescriptor>>,
    pub entries: Vec<ActivationEntry>,
}

type PlanKey = (PackKind, String, String);

fn plan_key(desc: &PackDescriptor) -> PlanKey {
    (
        desc.kind,
        desc.effective_author.clone(),
        desc.pack_tree_id.clone(),
    )
}

fn format_key(key: &PlanKey) -> String {
    format!("{}:{}@{}", key.0.as_str(), key.1, key.2)
}

/// Engine-internal pack planner.
///
/// Given root descriptors (typically an appPack and/or viewPack), computes
/// the dependency closure with deterministic depth-first ordering. Revisiting
/// a key already on the traversal stack is a cycle and is fatal; revisiting a
/// planned key is skipped.
pub struct PackPlanner<'a> {
    registry: &'a PackRegistry,
}

impl<'a> PackPlanner<'a> {
    pub fn new(registry: &'a PackRegistry) -> Self {
        Self { registry }
    }

    pub fn build_plan_for_roots(
        &self,
        roots: Vec<Arc<PackDescriptor>>,
    ) -> Result<ActivationPlan> {
        if roots.is_empty() {
            return Err(TurnixError::bad_request("activation plan roots cannot be empty"));
        }

        let mut visited: HashMap<PlanKey, usize> = HashMap::new();
        let mut order: Vec<ActivationEntry> = Vec::new();

        for root in &roots {
            self.visit(
                root.clone(),
                ActivationReason::Root,
                true,
                0,
                &mut Vec::new(),
                &mut visited,
                &mut order,
            )?;
        }

        info!(
            roots = roots.len(),
            entries = order.len(),
            "activation plan built"
        );
        Ok(ActivationPlan {
            roots,
            entries: order,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        desc: Arc<PackDescriptor>,
        reason: ActivationReason,
        required: bool,
        depth: usize,
        stack: &mut Vec<PlanKey>,
        visited: &mut HashMap<PlanKey, usize>,
        order: &mut Vec<ActivationEntry>,
    ) -> Result<()> {
        let key = plan_key(&desc);

        if stack.contains(&key) {
            let chain = stack
                .iter()
                .chain(std::iter::once(&key))
                .map(format_key)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(TurnixError::DependencyCycle { chain });
        }
        if visited.contains_key(&key) {
            // Already planned; depth and reason stay as first recorded.
            return Ok(());
        }

        visited.insert(key.clone(), order.len());
        order.push(ActivationEntry {
            descriptor: desc.clone(),
            reason,
            required,
            depth,
        });

        stack.push(key);

        // Hard dependencies first; failures are fatal for required packs.
        for dep in &desc.dependencies {
            match self.resolve(dep, &desc) {
                Ok(dep_desc) => {
                    self.visit(
                        dep_desc,
                        ActivationReason::Dependency,
                        true,
                        depth + 1,
                        stack,
                        visited,
                        order,
                    )?;
                }
                Err(err) => {
                    if required {
                        stack.pop();
                        return Err(err);
                    }
                    warn!(
                        pack = desc.pack_tree_id,
                        dep = dep.pack_tree_id,
                        %err,
                        "non-fatal dependency resolution failure"
                    );
                }
            }
        }

        // Recommended packs join the plan, but resolution failures only log.
        for rec in &desc.recommended {
            match self.resolve(rec, &desc) {
                Ok(rec_desc) => {
                    self.visit(
                        rec_desc,
                        ActivationReason::Recommended,
                        false,
                        depth + 1,
                        stack,
                        visited,
                        order,
                    )?;
                }
                Err(err) => {
                    info!(
                        pack = desc.pack_tree_id,
                        recommended = rec.pack_tree_id,
                        %err,
                        "recommended pack not resolved"
                    );
                }
            }
        }

        stack.pop();
        Ok(())
    }

    fn resolve(
        &self,
        request: &PackRequest,
        requesting: &PackDescriptor,
    ) -> Result<Arc<PackDescriptor>> {
        resolve_pack_selector(self.registry, request, Some(requesting), None, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packs::registry::tests_support::mod_desc;
    use crate::packs::PackKind;

    fn request(tree_id: &str) -> PackRequest {
        PackRequest {
            author: None,
            pack_tree_id: tree_id.to_string(),
            requirement: None,
            kind: Some(PackKind::Mod),
        }
    }

    #[test]
    fn plan_is_depth_first_with_first_encounter_depth() {
        // app -> a -> c, app -> b -> c (c planned once at depth 2)
        let mut app = mod_desc("app", "Turnix", Some("1.0.0"));
        app.kind = PackKind::App;
        app.dependencies = vec![request("a"), request("b")];

        let mut a = mod_desc("a", "Turnix", Some("1.0.0"));
        a.dependencies = vec![request("c")];
        let mut b = mod_desc("b", "Turnix", Some("1.0.0"));
        b.dependencies = vec![request("c")];
        let c = mod_desc("c", "Turnix", Some("1.0.0"));

        let registry =
            PackRegistry::new([app.clone(), a, b, c]).unwrap();
        let planner = PackPlanner::new(&registry);
        let root = registry
            .resolve_best("app", Some(PackKind::App), None, None, true)
            .unwrap();
        let plan = planner.build_plan_for_roots(vec![root]).unwrap();

        let ids: Vec<&str> = plan
            .entries
            .iter()
            .map(|e| e.descriptor.pack_tree_id.as_str())
            .collect();
        assert_eq!(ids, vec!["app", "a", "c", "b"]);
        let depths: Vec<usize> = plan.entries.iter().map(|e| e.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
        assert_eq!(plan.entries[0].reason, ActivationReason::Root);
        assert_eq!(plan.entries[1].reason, ActivationReason::Dependency);
    }

    #[test]
    fn dependency_cycles_are_fatal() {
        let mut a = mod_desc("a", "Turnix", Some("1.0.0"));
        a.dependencies = vec![request("b")];
        let mut b = mod_desc("b", "Turnix", Some("1.0.0"));
        b.dependencies = vec![request("a")];

        let registry = PackRegistry::new([a, b]).unwrap();
        let planner = PackPlanner::new(&registry);
        let root = registry
            .resolve_best("a", Some(PackKind::Mod), None, None, true)
            .unwrap();
        let err = planner.build_plan_for_roots(vec![root]).unwrap_err();
        match err {
            TurnixError::DependencyCycle { chain } => {
                assert!(chain.contains("mod:Turnix@a"));
                assert!(chain.contains("mod:Turnix@b"));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_dependency_is_fatal_missing_recommended_is_not() {
        let mut app = mod_desc("app", "Turnix", Some("1.0.0"));
        app.kind = PackKind::App;
        app.dependencies = vec![request("ghost")];

        let registry = PackRegistry::new([app]).unwrap();
        let planner = PackPlanner::new(&registry);
        let root = registry
            .resolve_best("app", Some(PackKind::App), None, None, true)
            .unwrap();
        assert!(planner.build_plan_for_roots(vec![root]).is_err());

        let mut app2 = mod_desc("app2", "Turnix", Some("1.0.0"));
        app2.kind = PackKind::App;
        app2.recommended = vec![request("ghost")];
        let registry = PackRegistry::new([app2]).unwrap();
        let planner = PackPlanner::new(&registry);
        let root = registry
            .resolve_best("app2", Some(PackKind::App), None, None, true)
            .unwrap();
        let plan = planner.build_plan_for_roots(vec![root]).unwrap();
        assert_eq!(plan.entries.len(), 1);
    }

    #[test]
    fn recommended_entries_are_marked_optional() {
        let mut app = mod_desc("app", "Turnix", Some("1.0.0"));
        app.kind = PackKind::App;
        app.recommended = vec![request("extra")];
        let extra = mod_desc("extra", "Turnix", Some("1.0.0"));

        let registry = PackRegistry::new([app, extra]).unwrap();
        let planner = PackPlanner::new(&registry);
        let root = registry
            .resolve_best("app", Some(PackKind::App), None, None, true)
            .unwrap();
        let plan = planner.build_plan_for_roots(vec![root]).unwrap();
        let entry = plan
            .entries
            .iter()
            .find(|e| e.descriptor.pack_tree_id == "extra")
            .unwrap();
        assert_eq!(entry.reason, ActivationReason::Recommended);
        assert!(!entry.required);
    }
}
