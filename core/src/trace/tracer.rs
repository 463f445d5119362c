//! Span/event tracer.
//!
//! Context is an explicit value the caller threads through (no task-local
//! storage): clone a `TraceContext`, add keys, pass it to `start_span` or
//! `event`. Known context keys are promoted to top-level record fields so the
//! trace viewer can filter without digging through attrs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::uuidv7_prefixed;
use crate::trace::TraceHub;
use crate::util::utc_now_iso;

/// Context keys copied to top-level record fields.
const PROMOTED_KEYS: [&str; 7] = [
    "appInstanceId",
    "appPackId",
    "sessionId",
    "pipelineRunId",
    "viewId",
    "clientId",
    "modId",
];

/// Ambient key/value context cloned into spans and events.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    values: Map<String, Value>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// A live span. End it exactly once via [`Tracer::end_span`]; double-end is a
/// no-op.
#[derive(Debug, Clone)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub span_name: String,
    pub context: TraceContext,
    started: Instant,
    ended: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// "spanStart" | "spanEnd" | "event"
    pub record_type: String,
    pub time: String,
    pub seq: u64,
    pub trace_id: String,
    pub span_id: String,
    pub level: String,
    pub tags: Vec<String>,
    pub attrs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// Promoted context keys (viewId, sessionId, pipelineRunId, ...).
    #[serde(flatten)]
    pub promoted: Map<String, Value>,
}

/// Emits spans/events to a [`TraceHub`]. Cheap to clone.
#[derive(Clone)]
pub struct Tracer {
    hub: Arc<TraceHub>,
    seq: Arc<AtomicU64>,
}

impl Tracer {
    pub fn new(hub: Arc<TraceHub>) -> Self {
        Self {
            hub,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn hub(&self) -> &Arc<TraceHub> {
        &self.hub
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn promoted_from(context: &TraceContext) -> Map<String, Value> {
        let mut out = Map::new();
        for key in PROMOTED_KEYS {
            if let Some(value) = context.values().get(key) {
                out.insert(key.to_string(), value.clone());
            }
        }
        out
    }

    fn merged_attrs(context: &TraceContext, attrs: Option<Map<String, Value>>) -> Map<String, Value> {
        let mut merged = context.values().clone();
        if let Some(attrs) = attrs {
            for (key, value) in attrs {
                merged.insert(key, value);
            }
        }
        merged
    }

    /// Start a root or child span and emit `spanStart`.
    pub fn start_span(
        &self,
        span_name: &str,
        parent: Option<&TraceSpan>,
        context: &TraceContext,
        attrs: Option<Map<String, Value>>,
        tags: &[&str],
    ) -> TraceSpan {
        let mut span_context = context.clone();
        if let Some(parent) = parent {
            // Parent context flows down; explicit overrides win.
            let mut inherited = parent.context.clone();
            for (key, value) in context.values() {
                inherited.set(key, value.clone());
            }
            span_context = inherited;
        }

        let trace_id = parent
            .map(|p| p.trace_id.clone())
            .unwrap_or_else(|| uuidv7_prefixed("trace_"));
        let span = TraceSpan {
            trace_id: trace_id.clone(),
            span_id: uuidv7_prefixed("span_"),
            parent_span_id: parent.map(|p| p.span_id.clone()),
            span_name: span_name.to_string(),
            context: span_context,
            started: Instant::now(),
            ended: Arc::new(AtomicBool::new(false)),
        };

        let record = TraceRecord {
            record_type: "spanStart".to_string(),
            time: utc_now_iso(),
            seq: self.next_seq(),
            trace_id,
            span_id: span.span_id.clone(),
            level: "info".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            attrs: Self::merged_attrs(&span.context, attrs),
            span_name: Some(span_name.to_string()),
            parent_span_id: span.parent_span_id.clone(),
            status: None,
            event_name: None,
            promoted: Self::promoted_from(&span.context),
        };
        self.hub.emit(record);
        span
    }

    /// End a span and emit `spanEnd` with `durationMs`. Ending twice is a
    /// no-op.
    pub fn end_span(
        &self,
        span: &TraceSpan,
        status: &str,
        attrs: Option<Map<String, Value>>,
        tags: &[&str],
    ) {
        if span.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        let duration_ms = span.started.elapsed().as_secs_f64() * 1000.0;
        let mut attrs = Self::merged_attrs(&span.context, attrs);
        attrs
            .entry("durationMs".to_string())
            .or_insert_with(|| Value::from(duration_ms));

        let record = TraceRecord {
            record_type: "spanEnd".to_string(),
            time: utc_now_iso(),
            seq: self.next_seq(),
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            level: "info".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            attrs,
            span_name: Some(span.span_name.clone()),
            parent_span_id: span.parent_span_id.clone(),
            status: Some(status.to_string()),
            event_name: None,
            promoted: Self::promoted_from(&span.context),
        };
        self.hub.emit(record);
    }

    /// Emit an event attached to `span` or to the bare context.
    pub fn event(
        &self,
        event_name: &str,
        level: &str,
        tags: &[&str],
        span: Option<&TraceSpan>,
        context: &TraceContext,
        attrs: Option<Map<String, Value>>,
    ) {
        self.hub.emit(self.make_event_record(event_name, level, tags, span, context, attrs));
    }

    pub(crate) fn make_event_record(
        &self,
        event_name: &str,
        level: &str,
        tags: &[&str],
        span: Option<&TraceSpan>,
        context: &TraceContext,
        attrs: Option<Map<String, Value>>,
    ) -> TraceRecord {
        let effective_context = span.map(|s| &s.context).unwrap_or(context);
        TraceRecord {
            record_type: "event".to_string(),
            time: utc_now_iso(),
            seq: self.next_seq(),
            trace_id: span.map(|s| s.trace_id.clone()).unwrap_or_default(),
            span_id: span.map(|s| s.span_id.clone()).unwrap_or_default(),
            level: level.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            attrs: Self::merged_attrs(effective_context, attrs),
            span_name: None,
            parent_span_id: None,
            status: None,
            event_name: Some(event_name.to_string()),
            promoted: Self::promoted_from(effective_context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracer() -> (Tracer, Arc<TraceHub>) {
        let hub = Arc::new(TraceHub::new(64, 64));
        (Tracer::new(hub.clone()), hub)
    }

    #[test]
    fn span_start_and_end_share_ids_and_duration_is_set() {
        let (tracer, hub) = tracer();
        let context = TraceContext::new().with("viewId", "view_1");
        let span = tracer.start_span("pipeline.run", None, &context, None, &["pipeline"]);
        tracer.end_span(&span, "ok", None, &["pipeline"]);

        let (records, _rx) = hub.subscribe();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, "spanStart");
        assert_eq!(records[1].record_type, "spanEnd");
        assert_eq!(records[0].span_id, records[1].span_id);
        assert_eq!(records[0].trace_id, records[1].trace_id);
        assert!(records[1].attrs.contains_key("durationMs"));
        // Promoted key appears top-level on both
        assert_eq!(records[0].promoted.get("viewId"), Some(&json!("view_1")));
    }

    #[test]
    fn double_end_is_a_noop() {
        let (tracer, hub) = tracer();
        let span = tracer.start_span("x", None, &TraceContext::new(), None, &[]);
        tracer.end_span(&span, "ok", None, &[]);
        tracer.end_span(&span, "error", None, &[]);
        assert_eq!(hub.buffered(), 2);
    }

    #[test]
    fn child_span_inherits_trace_and_parent() {
        let (tracer, _hub) = tracer();
        let root = tracer.start_span("root", None, &TraceContext::new(), None, &[]);
        let child = tracer.start_span("child", Some(&root), &TraceContext::new(), None, &[]);
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }

    #[test]
    fn event_attaches_to_span_context() {
        let (tracer, hub) = tracer();
        let context = TraceContext::new().with("sessionId", "ms_1");
        let span = tracer.start_span("s", None, &context, None, &[]);
        tracer.event(
            "pipeline.stage.enter",
            "debug",
            &["pipeline", "stage"],
            Some(&span),
            &TraceContext::new(),
            Some(Map::from_iter([("stage".to_string(), json!("BuildPrompt"))])),
        );

        let (records, _rx) = hub.subscribe();
        let event = records.last().unwrap();
        assert_eq!(event.event_name.as_deref(), Some("pipeline.stage.enter"));
        assert_eq!(event.span_id, span.span_id);
        assert_eq!(event.promoted.get("sessionId"), Some(&json!("ms_1")));
        assert_eq!(event.attrs.get("stage"), Some(&json!("BuildPrompt")));
    }

    #[test]
    fn seq_is_monotonic() {
        let (tracer, hub) = tracer();
        for _ in 0..4 {
            tracer.event("tick", "debug", &[], None, &TraceContext::new(), None);
        }
        let (records, _rx) = hub.subscribe();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }
}
