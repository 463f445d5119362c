//! The RPC dispatch loop.
//!
//! [`SocketSession`] holds the per-socket handshake state and interprets
//! frames; the binary's WebSocket handler feeds it text frames and forwards
//! whatever lands on the outbound queue. All ordering guarantees live here:
//! an ack goes out before any reply/error/stateUpdate for the same id, and a
//! generation bump suppresses replies from older handlers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Result, TurnixError};
use crate::permissions::PermissionManager;
use crate::rpc::{
    resolve_principal, ActiveSubscription, CapabilityRouter, ConnectionKey, ConnectionTable,
    ClientReadyOutcome, Gen, HandlerContext, MessageType, RpcConnection, RpcMessage,
};
use crate::sessions::Session;
use crate::views::{View, ViewRegistry};

/// Everything the dispatch loop needs from the engine, bundled so the socket
/// handler stays free of engine internals.
pub struct TransportCtx {
    pub settings: Arc<Settings>,
    pub views: Arc<ViewRegistry>,
    pub permissions: Arc<PermissionManager>,
    pub capabilities: Arc<CapabilityRouter>,
    pub connections: Arc<ConnectionTable>,
    /// The session requests run against (the active instance's main session).
    pub session_provider: Box<dyn Fn() -> Option<Arc<Session>> + Send + Sync>,
}

/// Per-socket protocol state machine.
pub struct SocketSession {
    ctx: Arc<TransportCtx>,
    outbound: mpsc::UnboundedSender<RpcMessage>,
    cookie_client_id: Option<String>,
    client_id: Option<String>,
    conn: Option<Arc<RpcConnection>>,
    view: Option<Arc<View>>,
}

impl SocketSession {
    pub fn new(
        ctx: Arc<TransportCtx>,
        outbound: mpsc::UnboundedSender<RpcMessage>,
        cookie_client_id: Option<String>,
    ) -> Self {
        Self {
            ctx,
            outbound,
            cookie_client_id,
            client_id: None,
            conn: None,
            view: None,
        }
    }

    pub fn connection(&self) -> Option<&Arc<RpcConnection>> {
        self.conn.as_ref()
    }

    pub fn view(&self) -> Option<&Arc<View>> {
        self.view.as_ref()
    }

    fn send(&self, msg: RpcMessage) {
        let _ = self.outbound.send(msg);
    }

    fn gen(&self) -> Gen {
        self.conn.as_ref().map(|c| c.gen()).unwrap_or_default()
    }

    /// Whether the heartbeat window has elapsed (checked periodically by the
    /// socket loop; expiry closes the connection).
    pub fn heartbeat_expired(&self, now_monotonic_ms: u64) -> bool {
        let Some(conn) = &self.conn else {
            return false;
        };
        let last = conn.last_heartbeat_ms();
        last > 0 && now_monotonic_ms.saturating_sub(last) > self.ctx.settings.protocol.heartbeat_timeout_ms
    }

    /// Handle one incoming text frame. `Err` means an invariant broke and the
    /// socket must close.
    pub async fn handle_text(&mut self, raw: &str) -> Result<()> {
        // Soft guard for pathological sizes, before any parsing.
        let cap = self.ctx.settings.protocol.max_frame_bytes;
        if raw.len() > cap {
            debug!(size = raw.len(), cap, "incoming frame too large");
            self.send(RpcMessage::error_standalone(
                self.gen(),
                "FRAME_TOO_LARGE",
                "payload too large",
            ));
            return Ok(());
        }

        let mut msg: RpcMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "invalid RPC frame dropped");
                return Ok(());
            }
        };
        msg.finish();

        if msg.msg_type == MessageType::Hello {
            return self.handle_hello(msg);
        }

        // Handshake is required: ignore anything before hello.
        let Some(conn) = self.conn.clone() else {
            return Ok(());
        };
        let view = self
            .view
            .clone()
            .ok_or_else(|| TurnixError::invariant("connection without a bound view"))?;

        match msg.msg_type {
            MessageType::ClientReady => self.handle_client_ready(&conn, &view, &msg),
            MessageType::Heartbeat => {
                conn.touch_heartbeat();
                self.send(RpcMessage::ack(
                    &msg,
                    conn.gen(),
                    self.ctx.settings.protocol.ack_wait_ms,
                ));
            }
            MessageType::Ack => {}
            MessageType::Cancel | MessageType::Unsubscribe => {
                self.ack(&conn, &msg);
                if let Some(correlates_to) = &msg.correlates_to {
                    conn.cancel_pending(correlates_to);
                    conn.cancel_subscription(correlates_to);
                }
            }
            MessageType::Subscribe => {
                self.ack(&conn, &msg);
                self.handle_subscribe(&conn, &view, msg).await;
            }
            MessageType::Request => {
                self.ack(&conn, &msg);
                self.handle_request(&conn, &view, msg);
            }
            MessageType::Emit => {
                self.ack(&conn, &msg);
                self.handle_emit(&conn, &view, msg);
            }
            // Server-originated types arriving from a client are dropped.
            _ => {}
        }
        Ok(())
    }

    /// Connection closed: cancel everything pending for it.
    pub fn handle_close(&self) {
        if let Some(conn) = &self.conn {
            conn.cancel_all_pending();
            conn.cancel_all_subscriptions();
        }
    }

    fn ack(&self, conn: &Arc<RpcConnection>, msg: &RpcMessage) {
        self.send(RpcMessage::ack(
            msg,
            conn.gen(),
            self.ctx.settings.protocol.ack_wait_ms,
        ));
    }

    // ----- Handshake -----

    fn handle_hello(&mut self, msg: RpcMessage) -> Result<()> {
        let client_id = match &self.cookie_client_id {
            Some(cid) if !cid.trim().is_empty() => cid.clone(),
            _ => self.ctx.views.ensure_client_id(None),
        };

        let view_id = msg.payload.get("viewId").and_then(|v| v.as_str());
        let view_token = msg.payload.get("viewToken").and_then(|v| v.as_str());

        let view = match (view_id, view_token) {
            (Some(view_id), Some(token))
                if self.ctx.views.validate_token(view_id, &client_id, token) =>
            {
                // Invariant: a validated token must reference an existing View.
                let view = self.ctx.views.view_by_id(view_id).ok_or_else(|| {
                    TurnixError::invariant(format!(
                        "token validated but view '{view_id}' not found"
                    ))
                })?;
                self.ctx.views.bind_client_to_view(&client_id, view_id);
                view
            }
            _ => {
                // Default singleplayer path: bind by clientId.
                let (view, _token) = self
                    .ctx
                    .views
                    .get_or_create_view_for_client(&client_id, "main")?;
                view
            }
        };

        let conn = self.ctx.connections.get_or_create(ConnectionKey {
            view_id: view.id.clone(),
            client_id: client_id.clone(),
            session_id: "session-1".to_string(),
        });

        // A new generation invalidates in-flight work from older ones.
        conn.cancel_all_pending();
        conn.cancel_all_subscriptions();
        let gen = conn.new_generation();

        if let Value::Object(server_state) = conn.server_state.clone() {
            view.patch_state(server_state);
        }
        conn.touch_heartbeat();

        self.send(RpcMessage::welcome(
            gen,
            serde_json::to_value(view.snapshot()).unwrap_or(json!({})),
        ));

        self.client_id = Some(client_id);
        self.conn = Some(conn);
        self.view = Some(view);
        Ok(())
    }

    // ----- clientReady -----

    fn handle_client_ready(
        &self,
        conn: &Arc<RpcConnection>,
        view: &Arc<View>,
        msg: &RpcMessage,
    ) {
        let outcome = conn.accept_client_ready(Some(msg.gen.num), msg.payload.clone());
        match outcome {
            ClientReadyOutcome::Accepted => {
                let loaded = msg.payload.get("loaded").cloned().unwrap_or(json!([]));
                let failed = msg.payload.get("failed").cloned().unwrap_or(json!([]));
                let mods_hash = msg.payload.get("modsHash").cloned().unwrap_or(Value::Null);
                let mut patch = Map::new();
                patch.insert(
                    "clientReady".to_string(),
                    json!({
                        "gen": conn.gen_num(),
                        "ts": msg.ts,
                        "mods": {"loaded": loaded, "failed": failed, "modsHash": mods_hash},
                    }),
                );
                view.patch_state(patch);
            }
            ClientReadyOutcome::Stale | ClientReadyOutcome::Duplicate => {
                debug!(
                    reported = msg.gen.num,
                    current = conn.gen_num(),
                    ?outcome,
                    "clientReady ignored"
                );
            }
        }
        self.ack(conn, msg);
    }

    // ----- Requests -----

    fn handler_context(&self, view: &Arc<View>, msg: &RpcMessage) -> HandlerContext {
        HandlerContext {
            msg_id: msg.id.clone(),
            principal: resolve_principal(msg),
            view: view.clone(),
            session: (self.ctx.session_provider)(),
        }
    }

    fn ensure_capability(
        &self,
        conn: &Arc<RpcConnection>,
        msg: &RpcMessage,
        capability: &str,
    ) -> bool {
        let principal = resolve_principal(msg);
        match self.ctx.permissions.ensure(&principal, capability) {
            Ok(()) => true,
            Err(err) => {
                self.send(RpcMessage::error_from(msg, conn.gen(), &err));
                false
            }
        }
    }

    fn handle_request(&self, conn: &Arc<RpcConnection>, view: &Arc<View>, msg: RpcMessage) {
        if let Some(object_id) = msg.object().map(str::to_string) {
            self.handle_request_object(conn, view, &msg, &object_id);
            return;
        }

        let Some(capability) = msg.capability().map(str::to_string) else {
            warn!(lane = msg.lane, "request without capability route");
            self.send(RpcMessage::error_frame(
                &msg,
                conn.gen(),
                "CAPABILITY_NOT_FOUND",
                "Unknown capability/route for request",
                false,
                None,
            ));
            return;
        };
        if self.ctx.capabilities.get(&capability).is_none() {
            warn!(capability, "unknown capability for request");
            self.send(RpcMessage::error_frame(
                &msg,
                conn.gen(),
                "CAPABILITY_NOT_FOUND",
                "Unknown capability/route for request",
                false,
                None,
            ));
            return;
        }
        if !self.ensure_capability(conn, &msg, &capability) {
            return;
        }

        // Idempotent replay: resend the cached reply as-is.
        let dedupe_key = conn.dedupe_key(&msg);
        if let Some(cached) = conn.cached_reply(&dedupe_key) {
            self.send(cached);
            return;
        }
        conn.remember(&dedupe_key);

        let ctx = self.handler_context(view, &msg);
        let budget_ms = msg
            .budget_ms
            .unwrap_or(self.ctx.settings.protocol.default_budget_ms)
            .min(self.ctx.settings.protocol.max_budget_ms);
        let gen_at_dispatch = conn.gen_num();
        let token = CancellationToken::new();

        let transport = self.ctx.clone();
        let outbound = self.outbound.clone();
        let task_conn = conn.clone();
        let task_token = token.clone();
        let task_msg = msg.clone();
        let handle = tokio::spawn(async move {
            let path = task_msg.path.clone().unwrap_or_default();
            let args = task_msg.args.clone().unwrap_or_default();

            let outcome = tokio::select! {
                _ = task_token.cancelled() => None,
                outcome = tokio::time::timeout(
                    Duration::from_millis(budget_ms),
                    transport
                        .capabilities
                        .route_request(&capability, &path, &args, &ctx),
                ) => Some(outcome),
            };

            let frame = match outcome {
                None => None,
                Some(Err(_elapsed)) => Some(RpcMessage::error_frame(
                    &task_msg,
                    task_conn.gen(),
                    "TIMEOUT",
                    &format!("request exceeded budget of {budget_ms}ms"),
                    true,
                    None,
                )),
                Some(Ok(Ok(payload))) => {
                    Some(RpcMessage::reply(&task_msg, task_conn.gen(), payload))
                }
                Some(Ok(Err(err))) => {
                    Some(RpcMessage::error_from(&task_msg, task_conn.gen(), &err))
                }
            };

            task_conn.remove_pending(&task_msg.id);
            let Some(frame) = frame else {
                return;
            };
            // A cancel beat us, or a newer generation took over: stay silent.
            if task_conn.is_cancelled(&task_msg.id) || task_conn.gen_num() != gen_at_dispatch {
                return;
            }
            if frame.msg_type == MessageType::Reply {
                task_conn.put_reply(&dedupe_key, frame.clone());
            }
            let _ = outbound.send(frame);
        });
        conn.add_pending(&msg.id, token, handle);
    }

    /// Object ops work against the session's memory by uuid.
    fn handle_request_object(
        &self,
        conn: &Arc<RpcConnection>,
        _view: &Arc<View>,
        msg: &RpcMessage,
        object_id: &str,
    ) {
        let Some(session) = (self.ctx.session_provider)() else {
            self.send(RpcMessage::error_frame(
                msg,
                conn.gen(),
                "SERVICE_UNAVAILABLE",
                "no active session",
                true,
                None,
            ));
            return;
        };

        let op = msg.op.as_deref().unwrap_or("get");
        match op {
            "get" => match session.memory().get_by_uuid(object_id, true) {
                Some((layer, obj)) => {
                    let payload = json!({
                        "layer": layer,
                        "object": serde_json::to_value(&obj).unwrap_or(Value::Null),
                    });
                    self.send(RpcMessage::reply(msg, conn.gen(), payload));
                }
                None => {
                    self.send(RpcMessage::error_frame(
                        msg,
                        conn.gen(),
                        "OBJECT_NOT_FOUND",
                        &format!("object '{object_id}' not found"),
                        false,
                        None,
                    ));
                }
            },
            other => {
                self.send(RpcMessage::error_frame(
                    msg,
                    conn.gen(),
                    "UNKNOWN_OP",
                    &format!("unknown object op '{other}'"),
                    false,
                    None,
                ));
            }
        }
    }

    // ----- Subscriptions -----

    async fn handle_subscribe(&self, conn: &Arc<RpcConnection>, view: &Arc<View>, msg: RpcMessage) {
        let Some(capability) = msg.capability().map(str::to_string) else {
            warn!(lane = msg.lane, "subscribe without capability route");
            self.send(RpcMessage::error_frame(
                &msg,
                conn.gen(),
                "CAPABILITY_NOT_FOUND",
                "Unknown capability/route for subscribe",
                false,
                None,
            ));
            return;
        };
        if self.ctx.capabilities.get(&capability).is_none() {
            warn!(capability, "unknown capability for subscribe");
            self.send(RpcMessage::error_frame(
                &msg,
                conn.gen(),
                "CAPABILITY_NOT_FOUND",
                "Unknown capability/route for subscribe",
                false,
                None,
            ));
            return;
        }
        if !self.ensure_capability(conn, &msg, &capability) {
            return;
        }

        let ctx = self.handler_context(view, &msg);
        let path = msg.path.clone().unwrap_or_default();
        let subscription = match self
            .ctx
            .capabilities
            .route_subscribe(&capability, &path, &msg.payload, &ctx)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                self.send(RpcMessage::error_from(&msg, conn.gen(), &err));
                return;
            }
        };

        let ActiveSubscription {
            initial,
            mut events,
            on_cancel,
        } = subscription;

        if let Some(initial) = initial {
            self.send(RpcMessage::state_update(&msg, conn.gen(), initial));
        }

        let gen_at_dispatch = conn.gen_num();
        let outbound = self.outbound.clone();
        let pump_conn = conn.clone();
        let pump_msg = msg.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if pump_conn.gen_num() != gen_at_dispatch {
                    break;
                }
                let frame = RpcMessage::state_update(&pump_msg, pump_conn.gen(), event);
                if outbound.send(frame).is_err() {
                    break;
                }
            }
        });

        conn.add_subscription(&msg.id, on_cancel, Some(pump));
    }

    // ----- Emits -----

    fn handle_emit(&self, conn: &Arc<RpcConnection>, view: &Arc<View>, msg: RpcMessage) {
        let Some(capability) = msg.capability().map(str::to_string) else {
            debug!(lane = msg.lane, "emit without capability route dropped");
            return;
        };
        if !self.ensure_capability(conn, &msg, &capability) {
            return;
        }
        let ctx = self.handler_context(view, &msg);
        let path = msg.path.clone().unwrap_or_default();
        self.ctx
            .capabilities
            .route_emit(&capability, &path, msg.payload.clone(), ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Grant;
    use crate::rpc::Capability;
    use crate::semver::Requirement;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoCap;

    #[async_trait]
    impl Capability for EchoCap {
        async fn call(
            &self,
            path: &str,
            args: &[Value],
            _ctx: &HandlerContext,
        ) -> crate::error::Result<Value> {
            Ok(json!({"echo": path, "args": args}))
        }

        async fn subscribe(
            &self,
            _path: &str,
            _payload: &Value,
            _ctx: &HandlerContext,
        ) -> crate::error::Result<ActiveSubscription> {
            let (tx, sub) = ActiveSubscription::channel(Some(json!({"snapshot": 1})));
            tokio::spawn(async move {
                let _ = tx.send(json!({"tick": 1}));
                // Keep the sender alive briefly so the pump sees the event.
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
            Ok(sub)
        }
    }

    struct SlowCap;

    #[async_trait]
    impl Capability for SlowCap {
        async fn call(
            &self,
            _path: &str,
            _args: &[Value],
            _ctx: &HandlerContext,
        ) -> crate::error::Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    fn transport_ctx(settings: Settings) -> Arc<TransportCtx> {
        let permissions = Arc::new(PermissionManager::new());
        // The test client never sets an origin, so it acts as "unknown".
        permissions.put_grant(Grant::allow(
            "unknown",
            "echo",
            Requirement::parse("*").unwrap(),
        ));
        permissions.put_grant(Grant::allow("unknown", "slow", None));

        let capabilities = Arc::new(CapabilityRouter::new());
        capabilities
            .register("echo@1", || Arc::new(EchoCap), false)
            .unwrap();
        capabilities
            .register("slow@1", || Arc::new(SlowCap), false)
            .unwrap();

        Arc::new(TransportCtx {
            settings: Arc::new(settings),
            views: Arc::new(ViewRegistry::new("turnix@main_menu")),
            permissions,
            capabilities,
            connections: Arc::new(ConnectionTable::new()),
            session_provider: Box::new(|| None),
        })
    }

    struct Harness {
        session: SocketSession,
        rx: mpsc::UnboundedReceiver<RpcMessage>,
    }

    fn harness(settings: Settings) -> Harness {
        let ctx = transport_ctx(settings);
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            session: SocketSession::new(ctx, tx, Some("c_test".to_string())),
            rx,
        }
    }

    fn hello_frame() -> String {
        json!({
            "v": "0.1", "id": "hello-1", "type": "hello",
            "gen": {"num": 0, "salt": ""}, "payload": {}
        })
        .to_string()
    }

    fn request_frame(id: &str, capability: &str, extra: Value) -> String {
        let mut frame = json!({
            "v": "0.1", "id": id, "type": "request",
            "gen": {"num": 1, "salt": "s"},
            "route": {"capability": capability},
            "path": "ping",
            "args": [1],
        });
        if let (Value::Object(frame), Value::Object(extra)) = (&mut frame, extra) {
            for (k, v) in extra {
                frame.insert(k, v);
            }
        }
        frame.to_string()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<RpcMessage>) -> RpcMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed")
    }

    #[tokio::test]
    async fn hello_produces_welcome_with_fresh_generation() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let welcome = recv(&mut h.rx).await;
        assert_eq!(welcome.msg_type, MessageType::Welcome);
        assert_eq!(welcome.gen.num, 1);
        assert_eq!(welcome.gen.salt.len(), 8);
        assert!(welcome.payload["viewId"]
            .as_str()
            .unwrap()
            .starts_with("view_"));
    }

    #[tokio::test]
    async fn frames_before_hello_are_dropped() {
        let mut h = harness(Settings::default());
        h.session
            .handle_text(&request_frame("m1", "echo@1", json!({})))
            .await
            .unwrap();
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_gets_ack_before_reply() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        h.session
            .handle_text(&request_frame("m1", "echo@1", json!({})))
            .await
            .unwrap();
        let ack = recv(&mut h.rx).await;
        assert_eq!(ack.msg_type, MessageType::Ack);
        assert_eq!(ack.correlates_to.as_deref(), Some("m1"));

        let reply = recv(&mut h.rx).await;
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert_eq!(reply.correlates_to.as_deref(), Some("m1"));
        assert_eq!(reply.payload["echo"], "ping");
        assert_eq!(reply.gen.num, 1);
    }

    #[tokio::test]
    async fn unknown_capability_errors() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        h.session
            .handle_text(&request_frame("m1", "ghost@1", json!({})))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;
        let error = recv(&mut h.rx).await;
        assert_eq!(error.msg_type, MessageType::Error);
        assert_eq!(error.payload["code"], "CAPABILITY_NOT_FOUND");
    }

    #[tokio::test]
    async fn permission_denied_surfaces_family() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        // slow@1 is registered but a request as a different principal lacks
        // a grant.
        h.session
            .handle_text(&request_frame(
                "m1",
                "slow@1",
                json!({"origin": {"modId": "stranger"}}),
            ))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;
        let error = recv(&mut h.rx).await;
        assert_eq!(error.payload["code"], "PERMISSION_DENIED");
        assert_eq!(error.payload["err"]["family"], "slow");
    }

    #[tokio::test]
    async fn idempotent_requests_resend_the_cached_reply() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        h.session
            .handle_text(&request_frame(
                "m1",
                "echo@1",
                json!({"idempotencyKey": "idem-1"}),
            ))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;
        let reply1 = recv(&mut h.rx).await;
        assert_eq!(reply1.msg_type, MessageType::Reply);

        h.session
            .handle_text(&request_frame(
                "m2",
                "echo@1",
                json!({"idempotencyKey": "idem-1"}),
            ))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;
        let reply2 = recv(&mut h.rx).await;
        assert_eq!(reply2.id, reply1.id);
    }

    #[tokio::test]
    async fn cancel_suppresses_the_reply() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        h.session
            .handle_text(&request_frame("m1", "slow@1", json!({})))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;

        let cancel = json!({
            "v": "0.1", "id": "m2", "type": "cancel",
            "gen": {"num": 1, "salt": "s"}, "correlatesTo": "m1",
        })
        .to_string();
        h.session.handle_text(&cancel).await.unwrap();
        let ack = recv(&mut h.rx).await;
        assert_eq!(ack.msg_type, MessageType::Ack);
        assert_eq!(ack.correlates_to.as_deref(), Some("m2"));

        // No reply or error for m1 arrives afterwards.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn budget_expiry_is_a_retryable_timeout() {
        let mut settings = Settings::default();
        settings.protocol.default_budget_ms = 50;
        let mut h = harness(settings);
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        h.session
            .handle_text(&request_frame("m1", "slow@1", json!({})))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;
        let error = recv(&mut h.rx).await;
        assert_eq!(error.payload["code"], "TIMEOUT");
        assert_eq!(error.payload["retryable"], true);
    }

    #[tokio::test]
    async fn subscribe_streams_initial_then_pushes() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        let subscribe = json!({
            "v": "0.1", "id": "m1", "type": "subscribe",
            "gen": {"num": 1, "salt": "s"},
            "route": {"capability": "echo@1"},
            "path": "thread",
        })
        .to_string();
        h.session.handle_text(&subscribe).await.unwrap();

        let _ack = recv(&mut h.rx).await;
        let initial = recv(&mut h.rx).await;
        assert_eq!(initial.msg_type, MessageType::StateUpdate);
        assert_eq!(initial.payload, json!({"snapshot": 1}));
        assert_eq!(initial.lane, "cap:echo@1");

        let pushed = recv(&mut h.rx).await;
        assert_eq!(pushed.msg_type, MessageType::StateUpdate);
        assert_eq!(pushed.payload, json!({"tick": 1}));
        assert_eq!(pushed.correlates_to.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn oversized_frames_get_frame_too_large() {
        let mut settings = Settings::default();
        settings.protocol.max_frame_bytes = 64;
        let mut h = harness(settings);

        let big = "x".repeat(65);
        h.session.handle_text(&big).await.unwrap();
        let error = recv(&mut h.rx).await;
        assert_eq!(error.msg_type, MessageType::Error);
        assert_eq!(error.payload["code"], "FRAME_TOO_LARGE");

        // One byte under the cap parses (and is dropped as invalid JSON, not
        // rejected for size).
        let ok = "y".repeat(64);
        h.session.handle_text(&ok).await.unwrap();
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_handshake_suppresses_older_generation_replies() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        h.session
            .handle_text(&request_frame("m1", "slow@1", json!({})))
            .await
            .unwrap();
        let _ack = recv(&mut h.rx).await;

        // Re-handshake bumps the generation and cancels in-flight work.
        h.session.handle_text(&hello_frame()).await.unwrap();
        let welcome = recv(&mut h.rx).await;
        assert_eq!(welcome.gen.num, 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_touches_liveness() {
        let mut h = harness(Settings::default());
        h.session.handle_text(&hello_frame()).await.unwrap();
        let _welcome = recv(&mut h.rx).await;

        let heartbeat = json!({
            "v": "0.1", "id": "hb-1", "type": "heartbeat",
            "gen": {"num": 1, "salt": "s"},
        })
        .to_string();
        h.session.handle_text(&heartbeat).await.unwrap();
        let ack = recv(&mut h.rx).await;
        assert_eq!(ack.msg_type, MessageType::Ack);

        let conn = h.session.connection().unwrap();
        assert!(conn.last_heartbeat_ms() > 0);
        assert!(!h.session.heartbeat_expired(conn.last_heartbeat_ms()));
    }
}
