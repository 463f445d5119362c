//! Canonical RPC wire message and its factories.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::TurnixError;
use crate::ids::uuidv7;
use crate::util::now_monotonic_ms;

pub const PROTOCOL_VERSION: &str = "0.1";

/// Server-assigned generation of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gen {
    pub num: u64,
    #[serde(default)]
    pub salt: String,
}

/// RPC addressing: capability or object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Ack,
    Heartbeat,
    Hello,
    Welcome,
    ClientReady,
    Request,
    Emit,
    Reply,
    Subscribe,
    StateUpdate,
    Unsubscribe,
    Cancel,
    Error,
}

fn default_lane() -> String {
    "noLaneSet".to_string()
}

fn default_payload() -> Value {
    json!({})
}

/// Canonical RPC wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    /// Message schema version.
    pub v: String,
    /// UUIDv7.
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Previous message in the sequence, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlates_to: Option<String>,
    /// Connection generation as set by the server.
    #[serde(default)]
    pub gen: Gen,
    /// Monotonic send time.
    #[serde(default)]
    pub ts: u64,
    /// How many ms the peer has to finish job + communication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// "Address" of the handler for this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Operation, when the route needs further specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Per-lane delivery sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Metadata only, never used for auth decisions beyond principal lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Map<String, Value>>,
    #[serde(default = "default_payload")]
    pub payload: Value,
    /// Logical ordering channel within the connection.
    #[serde(default = "default_lane")]
    pub lane: String,
}

impl RpcMessage {
    fn base(msg_type: MessageType, gen: Gen) -> Self {
        Self {
            v: PROTOCOL_VERSION.to_string(),
            id: uuidv7(),
            msg_type,
            correlates_to: None,
            gen,
            ts: now_monotonic_ms(),
            budget_ms: None,
            idempotency_key: None,
            route: None,
            op: None,
            path: None,
            args: None,
            seq: None,
            origin: None,
            payload: json!({}),
            lane: "sys".to_string(),
        }
    }

    /// Fill derived fields after deserialization: an unset lane falls back to
    /// the route (`cap:<capability>` / `obj:<object>`).
    pub fn finish(&mut self) {
        if self.lane.is_empty() || self.lane == "noLaneSet" {
            self.lane = match &self.route {
                Some(route) => {
                    if let Some(capability) = &route.capability {
                        format!("cap:{capability}")
                    } else if let Some(object) = &route.object {
                        format!("obj:{object}")
                    } else {
                        "noValidRouteLane".to_string()
                    }
                }
                None => "noLaneSet".to_string(),
            };
        }
        if self.ts == 0 {
            self.ts = now_monotonic_ms();
        }
    }

    pub fn capability(&self) -> Option<&str> {
        self.route
            .as_ref()
            .and_then(|r| r.capability.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn object(&self) -> Option<&str> {
        self.route
            .as_ref()
            .and_then(|r| r.object.as_deref())
            .map(str::trim)
            .filter(|o| !o.is_empty())
    }

    // ----- Factories -----

    pub fn welcome(gen: Gen, payload: Value) -> Self {
        let mut msg = Self::base(MessageType::Welcome, gen);
        msg.payload = payload;
        msg
    }

    pub fn ack(to: &RpcMessage, gen: Gen, ack_wait_ms: u64) -> Self {
        let mut msg = Self::base(MessageType::Ack, gen);
        msg.correlates_to = Some(to.id.clone());
        msg.route = to.route.clone();
        msg.budget_ms = Some(ack_wait_ms);
        msg
    }

    pub fn reply(to: &RpcMessage, gen: Gen, payload: Value) -> Self {
        let mut msg = Self::base(MessageType::Reply, gen);
        msg.correlates_to = Some(to.id.clone());
        msg.idempotency_key = to.idempotency_key.clone();
        msg.route = to.route.clone();
        msg.lane = to.lane.clone();
        msg.payload = payload;
        msg
    }

    pub fn state_update(to: &RpcMessage, gen: Gen, payload: Value) -> Self {
        let mut msg = Self::base(MessageType::StateUpdate, gen);
        msg.correlates_to = Some(to.id.clone());
        msg.route = to.route.clone();
        msg.lane = to.lane.clone();
        msg.payload = payload;
        msg
    }

    pub fn error_frame(
        to: &RpcMessage,
        gen: Gen,
        code: &str,
        message: &str,
        retryable: bool,
        err: Option<Value>,
    ) -> Self {
        let mut msg = Self::base(MessageType::Error, gen);
        msg.correlates_to = Some(to.id.clone());
        msg.route = to.route.clone();
        msg.payload = json!({
            "code": code,
            "message": message,
            "retryable": retryable,
            "err": err,
        });
        msg
    }

    /// An error frame with no originating message (pre-parse failures).
    pub fn error_standalone(gen: Gen, code: &str, message: &str) -> Self {
        let mut msg = Self::base(MessageType::Error, gen);
        msg.payload = json!({
            "code": code,
            "message": message,
            "retryable": false,
        });
        msg
    }

    pub fn error_from(to: &RpcMessage, gen: Gen, err: &TurnixError) -> Self {
        let extra = match err {
            TurnixError::PermissionDenied { family, .. } => Some(json!({"family": family})),
            _ => None,
        };
        Self::error_frame(
            to,
            gen,
            err.wire_code(),
            &err.to_string(),
            err.retryable(),
            extra,
        )
    }
}

/// Which principal (mod, client, system) originated a message.
pub fn resolve_principal(msg: &RpcMessage) -> String {
    msg.origin
        .as_ref()
        .and_then(|origin| {
            origin
                .get("modId")
                .or_else(|| origin.get("principal"))
                .and_then(|v| v.as_str())
        })
        .unwrap_or("unknown")
        .to_string()
}
