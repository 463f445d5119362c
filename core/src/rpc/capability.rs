//! Capability registration and routing.
//!
//! A capability is a named, versioned RPC surface (`"chat@1"`). Instances are
//! singletons created lazily from a provider closure. The router is the one
//! choke point where permissions are enforced before dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TurnixError};
use crate::sessions::Session;
use crate::views::View;

/// Context handed to capability methods.
#[derive(Clone)]
pub struct HandlerContext {
    pub msg_id: String,
    pub principal: String,
    pub view: Arc<View>,
    pub session: Option<Arc<Session>>,
}

/// A live subscription, normalized by the router.
///
/// The capability pushes events into `events`; the transport pumps them out
/// as `stateUpdate` frames. `on_cancel` runs synchronously when the client
/// unsubscribes or the connection closes.
pub struct ActiveSubscription {
    pub initial: Option<Value>,
    pub events: mpsc::UnboundedReceiver<Value>,
    pub on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ActiveSubscription {
    /// A subscription fed by a channel the capability keeps the sender of.
    pub fn channel(initial: Option<Value>) -> (mpsc::UnboundedSender<Value>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                initial,
                events: rx,
                on_cancel: None,
            },
        )
    }

    pub fn with_on_cancel(mut self, on_cancel: Box<dyn FnOnce() + Send>) -> Self {
        self.on_cancel = Some(on_cancel);
        self
    }
}

fn unsupported(op: &'static str) -> TurnixError {
    TurnixError::CapabilityUnsupported {
        capability: String::new(),
        op,
    }
}

/// A capability implementation. Methods are optional: the defaults report
/// the operation as unsupported and the router maps that to an error frame.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn call(&self, path: &str, args: &[Value], ctx: &HandlerContext) -> Result<Value> {
        let _ = (path, args, ctx);
        Err(unsupported("call"))
    }

    async fn emit(&self, path: &str, payload: &Value, ctx: &HandlerContext) -> Result<()> {
        let _ = (path, payload, ctx);
        Err(unsupported("emit"))
    }

    async fn subscribe(
        &self,
        path: &str,
        payload: &Value,
        ctx: &HandlerContext,
    ) -> Result<ActiveSubscription> {
        let _ = (path, payload, ctx);
        Err(unsupported("subscribe"))
    }
}

type Provider = Box<dyn Fn() -> Arc<dyn Capability> + Send + Sync>;

struct CapabilityFactory {
    provider: Provider,
    singleton: Option<Arc<dyn Capability>>,
}

impl CapabilityFactory {
    fn instance(&mut self) -> Arc<dyn Capability> {
        match &self.singleton {
            Some(instance) => instance.clone(),
            None => {
                let instance = (self.provider)();
                self.singleton = Some(instance.clone());
                instance
            }
        }
    }
}

/// Process-wide capability table.
#[derive(Default)]
pub struct CapabilityRouter {
    caps: Mutex<HashMap<String, CapabilityFactory>>,
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under a versioned name. With `replace = false` a
    /// duplicate name is an error; replacing clears the old singleton.
    pub fn register<F>(&self, name: &str, provider: F, replace: bool) -> Result<()>
    where
        F: Fn() -> Arc<dyn Capability> + Send + Sync + 'static,
    {
        let mut caps = self.caps.lock();
        if caps.contains_key(name) && !replace {
            return Err(TurnixError::bad_request(format!(
                "capability already registered: {name}"
            )));
        }
        caps.insert(
            name.to_string(),
            CapabilityFactory {
                provider: Box::new(provider),
                singleton: None,
            },
        );
        debug!(capability = name, replace, "capability registered");
        Ok(())
    }

    /// Bind a prebuilt instance as the singleton.
    pub fn register_instance(
        &self,
        name: &str,
        instance: Arc<dyn Capability>,
        replace: bool,
    ) -> Result<()> {
        let provider_instance = instance.clone();
        self.register(name, move || provider_instance.clone(), replace)
    }

    /// Drop the cached singleton; the next dispatch recreates it.
    pub fn reset_instance(&self, name: &str) -> bool {
        match self.caps.lock().get_mut(name) {
            Some(factory) => {
                factory.singleton = None;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.caps.lock().remove(name).is_some()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caps.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.caps.lock().get_mut(name).map(|f| f.instance())
    }

    fn named(&self, name: &str) -> Result<Arc<dyn Capability>> {
        self.get(name).ok_or_else(|| TurnixError::CapabilityNotFound {
            capability: name.to_string(),
        })
    }

    fn fill_name(err: TurnixError, name: &str) -> TurnixError {
        match err {
            TurnixError::CapabilityUnsupported { op, .. } => TurnixError::CapabilityUnsupported {
                capability: name.to_string(),
                op,
            },
            other => other,
        }
    }

    pub async fn route_request(
        &self,
        name: &str,
        path: &str,
        args: &[Value],
        ctx: &HandlerContext,
    ) -> Result<Value> {
        let cap = self.named(name)?;
        cap.call(path, args, ctx)
            .await
            .map_err(|err| Self::fill_name(err, name))
    }

    /// Emits are fire-and-forget: the capability runs on its own task and
    /// failures are logged at debug, never surfaced.
    pub fn route_emit(&self, name: &str, path: &str, payload: Value, ctx: HandlerContext) {
        let Some(cap) = self.get(name) else {
            debug!(capability = name, "emit to unknown capability dropped");
            return;
        };
        let name = name.to_string();
        let path = path.to_string();
        tokio::spawn(async move {
            if let Err(err) = cap.emit(&path, &payload, &ctx).await {
                debug!(capability = name, path, %err, "capability emit failed");
            }
        });
    }

    pub async fn route_subscribe(
        &self,
        name: &str,
        path: &str,
        payload: &Value,
        ctx: &HandlerContext,
    ) -> Result<ActiveSubscription> {
        let cap = self.named(name)?;
        cap.subscribe(path, payload, ctx)
            .await
            .map_err(|err| Self::fill_name(err, name))
    }
}
