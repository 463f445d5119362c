//! Built-in capabilities: chat, view state, pack index, trace stream.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::Engine;
use crate::error::{Result, TurnixError};
use crate::packs::PackDescriptor;
use crate::rpc::{ActiveSubscription, Capability, HandlerContext};
use crate::sessions::Session;
use crate::trace::TraceHub;

fn service_unavailable(message: &str) -> TurnixError {
    TurnixError::ServiceUnavailable {
        message: message.to_string(),
    }
}

fn unknown_op(op: &str) -> TurnixError {
    TurnixError::UnknownOp { op: op.to_string() }
}

pub fn register_all(engine: &Arc<Engine>) -> Result<()> {
    let router = engine.capabilities.clone();

    let weak = Arc::downgrade(engine);
    router.register(
        "chat@1",
        move || {
            Arc::new(ChatCapability {
                engine: weak.clone(),
            }) as Arc<dyn Capability>
        },
        true,
    )?;

    router.register(
        "view.state@1",
        move || Arc::new(ViewStateCapability) as Arc<dyn Capability>,
        true,
    )?;

    let weak = Arc::downgrade(engine);
    router.register(
        "packs.index@1",
        move || {
            Arc::new(PacksCapability {
                engine: weak.clone(),
            }) as Arc<dyn Capability>
        },
        true,
    )?;

    let hub = engine.trace_hub.clone();
    router.register(
        "trace.stream@1",
        move || {
            Arc::new(TraceStreamCapability { hub: hub.clone() }) as Arc<dyn Capability>
        },
        true,
    )?;

    Ok(())
}

// ---------------------------------------------------------------- //
// chat@1
// ---------------------------------------------------------------- //

struct ChatCapability {
    engine: Weak<Engine>,
}

impl ChatCapability {
    fn session(&self, ctx: &HandlerContext) -> Result<Arc<Session>> {
        if let Some(session) = &ctx.session {
            return Ok(session.clone());
        }
        self.engine
            .upgrade()
            .and_then(|engine| engine.main_session())
            .ok_or_else(|| service_unavailable("no active session"))
    }

    fn thread_snapshot(session: &Arc<Session>) -> Value {
        let thread_id = &session.thread_id;
        let order: Vec<String> = session
            .memory()
            .get(&format!("chat.{thread_id}.order"))
            .and_then(|obj| {
                obj.payload.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default();
        let mut messages = serde_json::Map::new();
        for oid in &order {
            if let Some(obj) = session.memory().get(&format!("chat.{thread_id}.{oid}")) {
                messages.insert(oid.clone(), obj.payload);
            }
        }
        json!({
            "kind": "threadSnapshot",
            "threadId": thread_id,
            "order": order,
            "messages": messages,
        })
    }
}

#[async_trait]
impl Capability for ChatCapability {
    async fn call(&self, path: &str, args: &[Value], ctx: &HandlerContext) -> Result<Value> {
        let session = self.session(ctx)?;
        match path {
            "send" => {
                let input = args.first().cloned().unwrap_or(json!({}));
                let initial = match input {
                    Value::Object(map) => map,
                    Value::String(text) => {
                        serde_json::Map::from_iter([("text".to_string(), json!(text))])
                    }
                    _ => return Err(TurnixError::bad_request("send expects {text} or a string")),
                };
                let run = session.pipeline().start_run("chat", initial);
                Ok(json!({
                    "runId": run.run_id,
                    "sessionId": session.id,
                    "status": "started",
                }))
            }
            "cancel" => {
                let run_id = args
                    .first()
                    .and_then(|a| a.get("runId"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| TurnixError::bad_request("cancel expects {runId}"))?;
                Ok(json!({"cancelled": session.pipeline().cancel(run_id)}))
            }
            "history" => Ok(Self::thread_snapshot(&session)),
            other => Err(unknown_op(other)),
        }
    }

    async fn subscribe(
        &self,
        path: &str,
        payload: &Value,
        ctx: &HandlerContext,
    ) -> Result<ActiveSubscription> {
        let session = self.session(ctx)?;
        match path {
            // Live events of one pipeline run.
            "run" => {
                let run_id = payload
                    .get("runId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| TurnixError::bad_request("subscribe run expects {runId}"))?;
                let events = session
                    .pipeline()
                    .events
                    .subscribe(&format!("run:{run_id}"));
                Ok(ActiveSubscription {
                    initial: None,
                    events,
                    on_cancel: None,
                })
            }
            // Thread snapshot now; deltas arrive via run subscriptions.
            "thread" => {
                let (_tx, sub) = ActiveSubscription::channel(Some(Self::thread_snapshot(&session)));
                Ok(sub)
            }
            other => Err(unknown_op(other)),
        }
    }
}

// ---------------------------------------------------------------- //
// view.state@1
// ---------------------------------------------------------------- //

struct ViewStateCapability;

#[async_trait]
impl Capability for ViewStateCapability {
    async fn call(&self, path: &str, args: &[Value], ctx: &HandlerContext) -> Result<Value> {
        match path {
            "get" => Ok(serde_json::to_value(ctx.view.snapshot())?),
            "patch" => {
                let patch = args
                    .first()
                    .and_then(|a| a.as_object())
                    .cloned()
                    .ok_or_else(|| TurnixError::bad_request("patch expects an object"))?;
                let version = ctx.view.patch_state(patch);
                Ok(json!({"ok": true, "version": version}))
            }
            "attachSession" => {
                let session_id = args
                    .first()
                    .and_then(|a| a.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| TurnixError::bad_request("attachSession expects {sessionId}"))?;
                let version = ctx.view.attach_session(session_id);
                Ok(json!({"ok": true, "version": version}))
            }
            "detachSession" => {
                let session_id = args
                    .first()
                    .and_then(|a| a.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| TurnixError::bad_request("detachSession expects {sessionId}"))?;
                let version = ctx.view.detach_session(session_id);
                Ok(json!({"ok": true, "version": version}))
            }
            other => Err(unknown_op(other)),
        }
    }

    async fn subscribe(
        &self,
        _path: &str,
        _payload: &Value,
        ctx: &HandlerContext,
    ) -> Result<ActiveSubscription> {
        let (_tx, sub) =
            ActiveSubscription::channel(Some(serde_json::to_value(ctx.view.snapshot())?));
        Ok(sub)
    }
}

// ---------------------------------------------------------------- //
// packs.index@1
// ---------------------------------------------------------------- //

struct PacksCapability {
    engine: Weak<Engine>,
}

fn descriptor_summary(desc: &PackDescriptor) -> Value {
    json!({
        "id": desc.pack_tree_id,
        "kind": desc.kind.as_str(),
        "name": desc.name,
        "author": desc.effective_author,
        "version": desc.effective_version.as_ref().map(|v| v.to_string()),
        "layer": desc.layer.as_str(),
        "packRoot": desc.pack_root.to_string_lossy(),
    })
}

#[async_trait]
impl Capability for PacksCapability {
    async fn call(&self, path: &str, args: &[Value], _ctx: &HandlerContext) -> Result<Value> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| service_unavailable("engine is shutting down"))?;
        match path {
            "list" => {
                let registry = engine.packs();
                let packs: Vec<Value> =
                    registry.all().iter().map(|d| descriptor_summary(d)).collect();
                Ok(json!({"packs": packs, "count": packs.len()}))
            }
            "resolve" => {
                let selector = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| TurnixError::bad_request("resolve expects a selector string"))?;
                let request = crate::packs::parse_pack_ref(selector, None)?;
                let desc = crate::packs::resolve_pack_selector(
                    &engine.packs(),
                    &request,
                    None,
                    None,
                    true,
                )?;
                Ok(descriptor_summary(&desc))
            }
            "rescan" => {
                let count = engine.rescan_packs()?;
                Ok(json!({"count": count}))
            }
            other => Err(unknown_op(other)),
        }
    }
}

// ---------------------------------------------------------------- //
// trace.stream@1
// ---------------------------------------------------------------- //

struct TraceStreamCapability {
    hub: Arc<TraceHub>,
}

#[async_trait]
impl Capability for TraceStreamCapability {
    async fn call(&self, path: &str, _args: &[Value], _ctx: &HandlerContext) -> Result<Value> {
        match path {
            "snapshot" => {
                let (records, _rx) = self.hub.subscribe();
                Ok(json!({"records": records}))
            }
            other => Err(unknown_op(other)),
        }
    }

    async fn subscribe(
        &self,
        _path: &str,
        _payload: &Value,
        _ctx: &HandlerContext,
    ) -> Result<ActiveSubscription> {
        let (snapshot, mut records) = self.hub.subscribe();
        let initial = json!({"records": snapshot});
        let (tx, sub) = ActiveSubscription::channel(Some(initial));
        tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let Ok(value) = serde_json::to_value(&record) else {
                    continue;
                };
                if tx.send(json!({"record": value})).is_err() {
                    break;
                }
            }
        });
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::build_roots;
    use crate::packs::roots::REQUIRED_SUBDIRS;
    use crate::views::View;

    fn engine_with_app() -> (tempfile::TempDir, Arc<Engine>) {
        let repo = tempfile::tempdir().unwrap();
        for name in REQUIRED_SUBDIRS {
            std::fs::create_dir_all(repo.path().join(name)).unwrap();
        }
        let app_dir = repo.path().join("first-party").join("appPacks").join("main-menu");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("manifest.json5"),
            json!({"id": "main-menu", "kind": "appPack", "version": "1.0.0", "author": "Turnix"})
                .to_string(),
        )
        .unwrap();

        let roots = build_roots(None, None, None, repo.path()).unwrap();
        let engine = Engine::new(Settings::default(), roots);
        engine.boot("main-menu").unwrap();
        (repo, engine)
    }

    fn ctx(engine: &Arc<Engine>) -> HandlerContext {
        HandlerContext {
            msg_id: "m1".into(),
            principal: "system".into(),
            view: Arc::new(View::new(None, "main", "Turnix@main-menu")),
            session: engine.main_session(),
        }
    }

    #[tokio::test]
    async fn chat_send_starts_a_run_and_history_reads_the_thread() {
        let (_repo, engine) = engine_with_app();
        let chat = engine.capabilities.get("chat@1").unwrap();
        let ctx = ctx(&engine);

        let result = chat
            .call("send", &[json!({"text": "hello"})], &ctx)
            .await
            .unwrap();
        let run_id = result["runId"].as_str().unwrap().to_string();
        assert!(run_id.starts_with("pipelineRun_"));

        let session = engine.main_session().unwrap();
        session.pipeline().await_run(&run_id).await;

        let history = chat.call("history", &[], &ctx).await.unwrap();
        assert_eq!(history["kind"], "threadSnapshot");
    }

    #[tokio::test]
    async fn view_state_calls_patch_and_read() {
        let (_repo, engine) = engine_with_app();
        let cap = engine.capabilities.get("view.state@1").unwrap();
        let ctx = ctx(&engine);

        cap.call("patch", &[json!({"menu": "open"})], &ctx)
            .await
            .unwrap();
        let snapshot = cap.call("get", &[], &ctx).await.unwrap();
        assert_eq!(snapshot["state"]["menu"], "open");

        let err = cap.call("unknown", &[], &ctx).await.unwrap_err();
        assert!(matches!(err, TurnixError::UnknownOp { .. }));
    }

    #[tokio::test]
    async fn packs_capability_lists_and_resolves() {
        let (_repo, engine) = engine_with_app();
        let cap = engine.capabilities.get("packs.index@1").unwrap();
        let ctx = ctx(&engine);

        let listed = cap.call("list", &[], &ctx).await.unwrap();
        assert_eq!(listed["count"], 1);

        let resolved = cap.call("resolve", &[json!("main-menu")], &ctx).await.unwrap();
        assert_eq!(resolved["kind"], "appPack");
        assert_eq!(resolved["author"], "Turnix");

        assert!(cap.call("resolve", &[json!("ghost")], &ctx).await.is_err());
    }

    #[tokio::test]
    async fn trace_stream_subscribe_gets_snapshot_then_tail() {
        let (_repo, engine) = engine_with_app();
        let cap = engine.capabilities.get("trace.stream@1").unwrap();
        let ctx = ctx(&engine);

        let mut sub = cap.subscribe("", &json!({}), &ctx).await.unwrap();
        let initial = sub.initial.take().unwrap();
        assert!(initial["records"].as_array().unwrap().len() > 0);

        engine.tracer.event(
            "test.event",
            "debug",
            &[],
            None,
            &crate::trace::TraceContext::new(),
            None,
        );
        let pushed = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sub.events.recv(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(pushed["record"]["eventName"], "test.event");
    }
}
