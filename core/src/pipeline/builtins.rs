//! Built-in stage subscribers.
//!
//! These cover the default chat flow: load chat history into query items,
//! collapse query items into an engine request, collect streamed deltas, and
//! stage the assistant message for commit. Driver mods can layer their own
//! subscribers around them via priorities.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::ids::uuid_12;
use crate::memory::MemoryObject;
use crate::pipeline::{Pipeline, Run, Stage, StageHandler, SubMode};
use crate::util::now_ms;

fn order_path(thread_id: &str) -> String {
    format!("session.chat.{thread_id}.order")
}

fn message_path(thread_id: &str, oid: &str) -> String {
    format!("session.chat.{thread_id}.{oid}")
}

/// Committed message order for a thread (staged entries are carried through
/// the run context instead).
fn committed_order(run: &Arc<Run>, thread_id: &str) -> Vec<String> {
    run.memory()
        .get(&format!("chat.{thread_id}.order"))
        .and_then(|obj| {
            obj.payload.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn stage_order(run: &Arc<Run>, thread_id: &str, order: &[String]) -> Result<()> {
    let mut obj = MemoryObject::new("order", json!(order));
    obj.path = order_path(thread_id);
    run.memory().save(obj)?;
    Ok(())
}

// ---------------------------------------------------------------- //
// BuildQueryItems: chat history -> query items + staged user message
// ---------------------------------------------------------------- //

struct ChatHistoryLoader {
    thread_id: String,
}

#[async_trait]
impl StageHandler for ChatHistoryLoader {
    async fn handle(
        &self,
        run: &Arc<Run>,
        _payload: Option<&Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let thread_id = &self.thread_id;
        let mut order = committed_order(run, thread_id);
        let mut items: Vec<Value> = Vec::new();

        for oid in &order {
            let Some(obj) = run.memory().get(&format!("chat.{thread_id}.{oid}")) else {
                continue;
            };
            let role = obj
                .payload
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("user");
            let text = obj
                .payload
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            items.push(json!({"role": role, "text": text, "oid": oid, "status": "final"}));
        }

        let user_text = run
            .get("input")
            .and_then(|input| {
                input
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let mut patch = Map::new();
        if !user_text.is_empty() {
            let oid = uuid_12("m_");
            let mut obj = MemoryObject::with_kind(
                &oid,
                "userMessage",
                json!({"role": "user", "text": user_text, "ts": now_ms()}),
            );
            obj.path = message_path(thread_id, &oid);
            run.memory().save(obj)?;

            order.push(oid.clone());
            stage_order(run, thread_id, &order)?;
            items.push(json!({"role": "user", "text": user_text, "oid": oid, "status": "final"}));
            patch.insert("userMessageOid".to_string(), json!(oid));
        }

        patch.insert("queryItems".to_string(), Value::Array(items));
        patch.insert("chatOrder".to_string(), json!(order));
        Ok(Some(patch))
    }
}

// ---------------------------------------------------------------- //
// BuildPrompt: query items -> engine request
// ---------------------------------------------------------------- //

struct PromptBuilder;

#[async_trait]
impl StageHandler for PromptBuilder {
    async fn handle(
        &self,
        run: &Arc<Run>,
        _payload: Option<&Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let items = run.get("queryItems").unwrap_or(json!([]));
        let messages: Vec<Value> = items
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        json!({
                            "role": item.get("role").and_then(|v| v.as_str()).unwrap_or("user"),
                            "content": item.get("text").and_then(|v| v.as_str()).unwrap_or(""),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut patch = Map::new();
        patch.insert("promptDraft".to_string(), json!({"messages": messages}));
        patch.insert(
            "engineRequest".to_string(),
            json!({"messages": messages, "stream": true}),
        );
        Ok(Some(patch))
    }
}

// ---------------------------------------------------------------- //
// ParseStreamedResponse (perChunk): accumulate deltas
// ---------------------------------------------------------------- //

struct StreamCollector;

#[async_trait]
impl StageHandler for StreamCollector {
    async fn handle(
        &self,
        run: &Arc<Run>,
        payload: Option<&Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let Some(chunk) = payload else {
            return Ok(None);
        };
        let mut patch = Map::new();
        if let Some(delta) = chunk.get("textDelta").and_then(|v| v.as_str()) {
            let mut text = run
                .get("assistantText")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            text.push_str(delta);
            patch.insert("assistantText".to_string(), json!(text));
        }
        if let Some(usage) = chunk.get("usage") {
            patch.insert("engineUsage".to_string(), usage.clone());
        }
        if patch.is_empty() {
            return Ok(None);
        }
        Ok(Some(patch))
    }
}

// ---------------------------------------------------------------- //
// ParseResponse: final response object
// ---------------------------------------------------------------- //

struct ResponseParser;

#[async_trait]
impl StageHandler for ResponseParser {
    async fn handle(
        &self,
        run: &Arc<Run>,
        _payload: Option<&Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let text = run
            .get("assistantText")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let mut patch = Map::new();
        patch.insert("engineResponse".to_string(), json!({"text": text}));
        Ok(Some(patch))
    }
}

// ---------------------------------------------------------------- //
// Finalize: stage the assistant message
// ---------------------------------------------------------------- //

struct ChatHistoryWriter {
    thread_id: String,
}

#[async_trait]
impl StageHandler for ChatHistoryWriter {
    async fn handle(
        &self,
        run: &Arc<Run>,
        _payload: Option<&Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let thread_id = &self.thread_id;
        let text = run
            .get("assistantText")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(None);
        }

        let oid = uuid_12("m_");
        let mut obj = MemoryObject::with_kind(
            &oid,
            "assistantMessage",
            json!({"role": "assistant", "text": text, "ts": now_ms(), "runId": run.run_id}),
        );
        obj.path = message_path(thread_id, &oid);
        run.memory().save(obj)?;

        let mut order = run
            .get("chatOrder")
            .and_then(|v| {
                v.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_else(|| committed_order(run, thread_id));
        order.push(oid.clone());
        stage_order(run, thread_id, &order)?;

        run.append(
            "messagesDelta",
            json!({"kind": "messageDelta", "oid": oid, "text": text}),
        );
        let mut patch = Map::new();
        patch.insert("assistantOid".to_string(), json!(oid));
        patch.insert("chatOrder".to_string(), json!(order));
        Ok(Some(patch))
    }
}

/// Wire the default chat flow into a pipeline.
pub fn register_builtin_subscribers(pipeline: &Pipeline, thread_id: &str) {
    pipeline.subscribe_to_stage(
        Stage::BuildQueryItems,
        Arc::new(ChatHistoryLoader {
            thread_id: thread_id.to_string(),
        }),
        -50,
        SubMode::Once,
    );
    pipeline.subscribe_to_stage(Stage::BuildPrompt, Arc::new(PromptBuilder), 0, SubMode::Once);
    pipeline.subscribe_to_stage(
        Stage::ParseStreamedResponse,
        Arc::new(StreamCollector),
        0,
        SubMode::PerChunk,
    );
    pipeline.subscribe_to_stage(Stage::ParseResponse, Arc::new(ResponseParser), 0, SubMode::Once);
    pipeline.subscribe_to_stage(
        Stage::Finalize,
        Arc::new(ChatHistoryWriter {
            thread_id: thread_id.to_string(),
        }),
        50,
        SubMode::Once,
    );
}
