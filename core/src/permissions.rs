//! Capability permission grants.
//!
//! Grants are stored per `(principal, family)`; ranges are npm-style semver
//! requirements. The capability router calls [`PermissionManager::ensure`] at
//! dispatch, which is the single enforcement point.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, TurnixError};
use crate::semver::{parse_version, Requirement, Version};
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// A permission grant for a `(principal, family)` pair, e.g.
/// `("llama.cpp", "chat")`. The range is an npm-style requirement
/// (`None` = any version).
#[derive(Debug, Clone)]
pub struct Grant {
    pub principal: String,
    pub family: String,
    pub range: Option<Requirement>,
    pub decision: Decision,
    /// Optional structured scope, e.g. `{ "hosts": ["api.example.com"] }`.
    pub scope: Option<Value>,
    /// None means no expiry.
    pub expires_at_ms: Option<i64>,
}

impl Grant {
    pub fn allow(principal: impl Into<String>, family: impl Into<String>, range: Option<Requirement>) -> Self {
        Self {
            principal: principal.into(),
            family: family.into(),
            range,
            decision: Decision::Allow,
            scope: None,
            expires_at_ms: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms() > at)
    }
}

/// Parse `"family@version"`. The version is coerced leniently ("1.5" ->
/// 1.5.0); a malformed version is treated as absent.
pub fn parse_capability(capability: &str) -> (String, Option<Version>) {
    let text = capability.trim();
    let Some((family, version)) = text.split_once('@') else {
        return (text.to_string(), None);
    };
    let version = version.trim();
    if version.is_empty() {
        return (family.to_string(), None);
    }
    (family.to_string(), parse_version(version).ok())
}

/// Parse `"family@npm-range"`; errors on an invalid range. No `@` means any
/// version.
pub fn parse_capability_range(capability: &str) -> Result<(String, Option<Requirement>)> {
    let text = capability.trim();
    let Some((family, range)) = text.split_once('@') else {
        return Ok((text.to_string(), None));
    };
    let requirement = Requirement::parse(range)?;
    Ok((family.to_string(), requirement))
}

struct CapabilityMeta {
    baseline: Option<Requirement>,
    risk: String,
}

/// Process-wide permission store and enforcement point.
#[derive(Default)]
pub struct PermissionManager {
    grants: Mutex<HashMap<(String, String), Grant>>,
    caps_meta: Mutex<HashMap<String, CapabilityMeta>>,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a capability family and its baseline npm range (informational),
    /// e.g. `"chat@^1"`, `"http.client@>=1.5 <2"`.
    pub fn register_capability(&self, capability: &str, risk: &str) -> Result<()> {
        let (family, baseline) = parse_capability_range(capability)?;
        self.caps_meta.lock().insert(
            family,
            CapabilityMeta {
                baseline,
                risk: risk.to_string(),
            },
        );
        Ok(())
    }

    pub fn capability_baseline(&self, family: &str) -> Option<String> {
        self.caps_meta
            .lock()
            .get(family)
            .and_then(|meta| meta.baseline.as_ref().map(|r| r.to_string()))
    }

    pub fn capability_risk(&self, family: &str) -> Option<String> {
        self.caps_meta.lock().get(family).map(|meta| meta.risk.clone())
    }

    // ---------- Grant management ----------

    /// Store a grant. One grant per `(principal, family)`; a new one replaces
    /// the old.
    pub fn put_grant(&self, grant: Grant) {
        self.grants
            .lock()
            .insert((grant.principal.clone(), grant.family.clone()), grant);
    }

    pub fn revoke_grant(&self, principal: &str, family: &str) {
        self.grants
            .lock()
            .remove(&(principal.to_string(), family.to_string()));
    }

    /// Look up a grant; expired grants are dropped on read.
    pub fn get_grant(&self, principal: &str, family: &str) -> Option<Grant> {
        let key = (principal.to_string(), family.to_string());
        let mut grants = self.grants.lock();
        match grants.get(&key) {
            Some(grant) if grant.is_expired() => {
                grants.remove(&key);
                None
            }
            Some(grant) => Some(grant.clone()),
            None => None,
        }
    }

    // ---------- Enforcement ----------

    /// Enforce permission for a requested capability.
    ///
    /// `capability` is either `"family@version"` (the concrete version must
    /// sit inside the grant's range) or bare `"family"` (an allow grant must
    /// exist).
    pub fn ensure(&self, principal: &str, capability: &str) -> Result<()> {
        let (family, requested) = parse_capability(capability);

        let denied = |detail: String| {
            warn!(principal, family, capability, detail, "permission denied");
            TurnixError::PermissionDenied {
                family: family.clone(),
                detail,
            }
        };

        let Some(grant) = self.get_grant(principal, &family) else {
            return Err(denied(format!(
                "principal '{principal}' lacks a grant for '{family}'"
            )));
        };

        if grant.decision != Decision::Allow {
            return Err(denied(format!("grant for '{family}' is denied")));
        }

        if let Some(version) = requested {
            let in_range = grant
                .range
                .as_ref()
                .map_or(true, |range| range.matches(&version));
            if !in_range {
                let range = grant
                    .range
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "*".to_string());
                return Err(denied(format!(
                    "requested '{family}@{version}' outside granted range '{range}'"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(raw: &str) -> Option<Requirement> {
        Requirement::parse(raw).unwrap()
    }

    #[test]
    fn parse_capability_coerces_and_tolerates_junk() {
        let (family, version) = parse_capability("chat@1.5");
        assert_eq!(family, "chat");
        assert_eq!(version.unwrap().to_string(), "1.5.0");

        let (family, version) = parse_capability("chat");
        assert_eq!(family, "chat");
        assert!(version.is_none());

        // Malformed version -> treated as no version
        let (_, version) = parse_capability("chat@banana");
        assert!(version.is_none());
        let (_, version) = parse_capability("chat@^1");
        assert!(version.is_none());
    }

    #[test]
    fn missing_grant_denies() {
        let perms = PermissionManager::new();
        perms.register_capability("chat@^1", "low").unwrap();
        let err = perms.ensure("demo-mod", "chat@1").unwrap_err();
        match err {
            TurnixError::PermissionDenied { family, .. } => assert_eq!(family, "chat"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn allow_grant_with_range_checks_requested_version() {
        let perms = PermissionManager::new();
        perms.put_grant(Grant::allow("demo-mod", "chat", range("^1")));

        perms.ensure("demo-mod", "chat@1.5.0").unwrap();
        perms.ensure("demo-mod", "chat").unwrap();
        assert!(perms.ensure("demo-mod", "chat@2.0.0").is_err());
    }

    #[test]
    fn deny_grant_denies_even_in_range() {
        let perms = PermissionManager::new();
        perms.put_grant(Grant {
            decision: Decision::Deny,
            ..Grant::allow("demo-mod", "chat", range("^1"))
        });
        assert!(perms.ensure("demo-mod", "chat@1.0.0").is_err());
    }

    #[test]
    fn expired_grants_are_dropped_on_read() {
        let perms = PermissionManager::new();
        perms.put_grant(Grant {
            expires_at_ms: Some(now_ms() - 1000),
            ..Grant::allow("demo-mod", "chat", None)
        });
        assert!(perms.get_grant("demo-mod", "chat").is_none());
        assert!(perms.ensure("demo-mod", "chat").is_err());
    }

    #[test]
    fn one_grant_per_principal_family() {
        let perms = PermissionManager::new();
        perms.put_grant(Grant::allow("shared-principal", "chat", range("^1")));
        perms.put_grant(Grant::allow("shared-principal", "chat", range("^2")));

        // The second grant replaced the first
        assert!(perms.ensure("shared-principal", "chat@1.0.0").is_err());
        perms.ensure("shared-principal", "chat@2.1.0").unwrap();
    }

    #[test]
    fn baseline_registration_is_informational() {
        let perms = PermissionManager::new();
        perms.register_capability("chat@^1", "low").unwrap();
        assert_eq!(perms.capability_baseline("chat").unwrap(), ">=1.0.0 <2.0.0");
        assert!(perms.register_capability("bad@not a range", "low").is_err());
    }
}
