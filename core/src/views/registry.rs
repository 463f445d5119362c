//! Client -> View binding and view-token authentication.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TurnixError};
use crate::ids::{short_token, uuid_12};
use crate::util::timing_safe_eq;
use crate::views::View;

const VIEW_TOKEN_BYTES: usize = 24;

struct RegistryState {
    views_by_id: HashMap<String, Arc<View>>,
    bindings_by_client_id: HashMap<String, String>,
    /// (viewId, clientId) -> viewToken
    tokens: HashMap<(String, String), String>,
}

/// Maps client cookies to views (1:1) and mints the unguessable tokens that
/// authenticate socket reattachment. Tokens rotate on every bootstrap.
pub struct ViewRegistry {
    default_app_pack_id: String,
    state: Mutex<RegistryState>,
}

impl ViewRegistry {
    pub fn new(default_app_pack_id: &str) -> Self {
        Self {
            default_app_pack_id: default_app_pack_id.to_string(),
            state: Mutex::new(RegistryState {
                views_by_id: HashMap::new(),
                bindings_by_client_id: HashMap::new(),
                tokens: HashMap::new(),
            }),
        }
    }

    fn mint_view_token() -> String {
        short_token(VIEW_TOKEN_BYTES)
    }

    /// Keep an existing non-empty cookie; otherwise mint a fresh clientId.
    pub fn ensure_client_id(&self, cookie: Option<&str>) -> String {
        match cookie {
            Some(cid) if !cid.trim().is_empty() => cid.to_string(),
            _ => uuid_12("c_"),
        }
    }

    /// Returns `(view, viewToken)`; creates a view on first contact and
    /// rotates the token on every call.
    pub fn get_or_create_view_for_client(
        &self,
        client_id: &str,
        view_kind: &str,
    ) -> Result<(Arc<View>, String)> {
        if client_id.trim().is_empty() {
            return Err(TurnixError::bad_request("clientId must be non-empty"));
        }

        let mut state = self.state.lock();
        let view = match state.bindings_by_client_id.get(client_id) {
            Some(view_id) => state
                .views_by_id
                .get(view_id)
                .cloned()
                .ok_or_else(|| {
                    TurnixError::invariant(format!(
                        "client '{client_id}' is bound to missing view '{view_id}'"
                    ))
                })?,
            None => {
                let view = Arc::new(View::new(None, view_kind, &self.default_app_pack_id));
                state
                    .bindings_by_client_id
                    .insert(client_id.to_string(), view.id.clone());
                state.views_by_id.insert(view.id.clone(), view.clone());
                view
            }
        };

        let token = Self::mint_view_token();
        state
            .tokens
            .insert((view.id.clone(), client_id.to_string()), token.clone());
        Ok((view, token))
    }

    pub fn issue_token(&self, view_id: &str, client_id: &str) -> String {
        let token = Self::mint_view_token();
        self.state
            .lock()
            .tokens
            .insert((view_id.to_string(), client_id.to_string()), token.clone());
        token
    }

    pub fn revoke_token(&self, view_id: &str, client_id: &str) {
        self.state
            .lock()
            .tokens
            .remove(&(view_id.to_string(), client_id.to_string()));
    }

    /// Timing-safe token check.
    pub fn validate_token(&self, view_id: &str, client_id: &str, token: &str) -> bool {
        if view_id.is_empty() || client_id.is_empty() || token.is_empty() {
            return false;
        }
        let state = self.state.lock();
        match state
            .tokens
            .get(&(view_id.to_string(), client_id.to_string()))
        {
            Some(stored) => timing_safe_eq(stored, token),
            None => false,
        }
    }

    pub fn view_by_id(&self, view_id: &str) -> Option<Arc<View>> {
        self.state.lock().views_by_id.get(view_id).cloned()
    }

    /// Rebind a client to a view, dropping any token for the old binding.
    pub fn bind_client_to_view(&self, client_id: &str, view_id: &str) {
        let mut state = self.state.lock();
        if let Some(old_view_id) = state.bindings_by_client_id.get(client_id).cloned() {
            if old_view_id != view_id {
                state
                    .tokens
                    .remove(&(old_view_id, client_id.to_string()));
            }
        }
        state
            .bindings_by_client_id
            .insert(client_id.to_string(), view_id.to_string());
        if !state.views_by_id.contains_key(view_id) {
            let view = Arc::new(View::new(
                Some(view_id.to_string()),
                "main",
                &self.default_app_pack_id,
            ));
            state.views_by_id.insert(view_id.to_string(), view);
        }
    }

    pub fn unbind_client(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.bindings_by_client_id.remove(client_id) {
            Some(view_id) => {
                state.tokens.remove(&(view_id, client_id.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn destroy_view(&self, view_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.views_by_id.remove(view_id).is_none() {
            return false;
        }
        let clients: Vec<String> = state
            .bindings_by_client_id
            .iter()
            .filter(|(_, vid)| vid.as_str() == view_id)
            .map(|(cid, _)| cid.clone())
            .collect();
        for client_id in clients {
            state.bindings_by_client_id.remove(&client_id);
            state.tokens.remove(&(view_id.to_string(), client_id));
        }
        true
    }

    pub fn view_ids(&self) -> Vec<String> {
        self.state.lock().views_by_id.keys().cloned().collect()
    }
}
