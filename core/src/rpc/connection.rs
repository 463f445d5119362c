//! Per-connection RPC state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rpc::{Gen, RpcMessage};
use crate::util::{now_monotonic_ms, now_ms};

const MAX_CACHE: usize = 512;
const CLIENT_READY_PRUNE_ABOVE: usize = 256;
const CLIENT_READY_KEEP: u64 = 64;

/// Connection identity: `(viewId, clientId, sessionId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub view_id: String,
    pub client_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientReadyOutcome {
    Accepted,
    Stale,
    Duplicate,
}

struct PendingEntry {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct SubscriptionEntry {
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
    pump: Option<JoinHandle<()>>,
}

struct ConnState {
    gen_num: u64,
    gen_salt: String,
    id_cache: HashSet<String>,
    reply_cache: HashMap<String, RpcMessage>,
    cancelled: HashSet<String>,
    last_heartbeat_ms: u64,
    last_client_ready: Option<Value>,
    client_ready_gens: HashSet<u64>,
}

/// Holds per-connection state: generation, idempotency cache, pending jobs,
/// subscriptions, heartbeat bookkeeping.
pub struct RpcConnection {
    pub key: ConnectionKey,
    /// Initial server-side state merged into the view on handshake.
    pub server_state: Value,
    state: Mutex<ConnState>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
}

impl RpcConnection {
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            server_state: serde_json::json!({
                "serverMessage": "Welcome to Turnix RPC",
                "serverBootTs": now_ms(),
            }),
            state: Mutex::new(ConnState {
                gen_num: 0,
                gen_salt: String::new(),
                id_cache: HashSet::new(),
                reply_cache: HashMap::new(),
                cancelled: HashSet::new(),
                last_heartbeat_ms: 0,
                last_client_ready: None,
                client_ready_gens: HashSet::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    // ----- Generation -----

    pub fn new_generation(&self) -> Gen {
        let mut state = self.state.lock();
        state.gen_num += 1;
        let mut salt = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut salt);
        state.gen_salt = hex::encode(salt);
        Gen {
            num: state.gen_num,
            salt: state.gen_salt.clone(),
        }
    }

    pub fn gen(&self) -> Gen {
        let state = self.state.lock();
        Gen {
            num: state.gen_num,
            salt: state.gen_salt.clone(),
        }
    }

    pub fn gen_num(&self) -> u64 {
        self.state.lock().gen_num
    }

    // ----- Idempotency / reply cache -----

    pub fn dedupe_key(&self, msg: &RpcMessage) -> String {
        msg.idempotency_key.clone().unwrap_or_else(|| msg.id.clone())
    }

    /// Remember an idempotency key; prunes roughly a quarter past the soft
    /// cap.
    pub fn remember(&self, key: &str) {
        let mut state = self.state.lock();
        state.id_cache.insert(key.to_string());
        if state.id_cache.len() > MAX_CACHE {
            let drop: Vec<String> = state
                .id_cache
                .iter()
                .take(MAX_CACHE / 4)
                .cloned()
                .collect();
            for key in drop {
                state.id_cache.remove(&key);
            }
        }
    }

    pub fn is_remembered(&self, key: &str) -> bool {
        self.state.lock().id_cache.contains(key)
    }

    pub fn put_reply(&self, key: &str, reply: RpcMessage) {
        let mut state = self.state.lock();
        state.reply_cache.insert(key.to_string(), reply);
        if state.reply_cache.len() > MAX_CACHE {
            let drop: Vec<String> = state
                .reply_cache
                .keys()
                .take(MAX_CACHE / 4)
                .cloned()
                .collect();
            for key in drop {
                state.reply_cache.remove(&key);
            }
        }
    }

    pub fn cached_reply(&self, key: &str) -> Option<RpcMessage> {
        self.state.lock().reply_cache.get(key).cloned()
    }

    // ----- Heartbeat -----

    pub fn touch_heartbeat(&self) {
        self.state.lock().last_heartbeat_ms = now_monotonic_ms();
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.state.lock().last_heartbeat_ms
    }

    // ----- clientReady -----

    /// Record a clientReady for `reported_gen`. Stale and duplicate signals
    /// are acked by the caller but otherwise ignored.
    pub fn accept_client_ready(&self, reported_gen: Option<u64>, payload: Value) -> ClientReadyOutcome {
        let mut state = self.state.lock();
        let current = state.gen_num;
        if let Some(reported) = reported_gen {
            if reported != current {
                return ClientReadyOutcome::Stale;
            }
        }
        if state.client_ready_gens.contains(&current) {
            return ClientReadyOutcome::Duplicate;
        }
        state.client_ready_gens.insert(current);
        if state.client_ready_gens.len() > CLIENT_READY_PRUNE_ABOVE {
            let base = current.saturating_sub(CLIENT_READY_KEEP);
            state.client_ready_gens.retain(|g| *g >= base);
        }
        state.last_client_ready = Some(payload);
        ClientReadyOutcome::Accepted
    }

    pub fn last_client_ready(&self) -> Option<Value> {
        self.state.lock().last_client_ready.clone()
    }

    // ----- Pending requests -----

    pub fn add_pending(&self, id: &str, token: CancellationToken, handle: JoinHandle<()>) {
        self.pending.lock().insert(
            id.to_string(),
            PendingEntry {
                token,
                handle: Some(handle),
            },
        );
    }

    pub fn remove_pending(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.state.lock().cancelled.contains(id)
    }

    /// Cancel one pending request: the cancelled flag is set first so the
    /// handler task can observe it before the token fires.
    pub fn cancel_pending(&self, id: &str) -> bool {
        self.state.lock().cancelled.insert(id.to_string());
        match self.pending.lock().remove(id) {
            Some(entry) => {
                entry.token.cancel();
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_pending(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.token.cancel();
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
        self.state.lock().cancelled.clear();
    }

    // ----- Subscriptions -----

    pub fn add_subscription(
        &self,
        correlates_to: &str,
        on_cancel: Option<Box<dyn FnOnce() + Send>>,
        pump: Option<JoinHandle<()>>,
    ) {
        self.subscriptions.lock().insert(
            correlates_to.to_string(),
            SubscriptionEntry { on_cancel, pump },
        );
    }

    /// Cancel one subscription: `on_cancel` runs synchronously, then the pump
    /// task is aborted.
    pub fn cancel_subscription(&self, correlates_to: &str) -> bool {
        match self.subscriptions.lock().remove(correlates_to) {
            Some(entry) => {
                if let Some(on_cancel) = entry.on_cancel {
                    on_cancel();
                }
                if let Some(pump) = entry.pump {
                    pump.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_subscriptions(&self) {
        let entries: Vec<SubscriptionEntry> = {
            let mut subs = self.subscriptions.lock();
            subs.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(on_cancel) = entry.on_cancel {
                on_cancel();
            }
            if let Some(pump) = entry.pump {
                pump.abort();
            }
        }
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }
}

/// Process-wide table of RPC connections.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<ConnectionKey, Arc<RpcConnection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: ConnectionKey) -> Arc<RpcConnection> {
        let mut connections = self.connections.lock();
        connections
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RpcConnection::new(key)))
            .clone()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<RpcConnection>> {
        self.connections.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection() -> RpcConnection {
        RpcConnection::new(ConnectionKey {
            view_id: "view_1".into(),
            client_id: "c_1".into(),
            session_id: "session-1".into(),
        })
    }

    #[test]
    fn generations_increment_with_fresh_salt() {
        let conn = connection();
        let gen1 = conn.new_generation();
        let gen2 = conn.new_generation();
        assert_eq!(gen1.num, 1);
        assert_eq!(gen2.num, 2);
        assert_eq!(gen1.salt.len(), 8);
        assert_ne!(gen1.salt, gen2.salt);
        assert_eq!(conn.gen(), gen2);
    }

    #[test]
    fn client_ready_dedupes_within_generation() {
        let conn = connection();
        conn.new_generation();
        assert_eq!(
            conn.accept_client_ready(Some(1), json!({"mods": {}})),
            ClientReadyOutcome::Accepted
        );
        assert_eq!(
            conn.accept_client_ready(Some(1), json!({})),
            ClientReadyOutcome::Duplicate
        );
        // A stale gen is ignored
        assert_eq!(
            conn.accept_client_ready(Some(0), json!({})),
            ClientReadyOutcome::Stale
        );
        // The next generation accepts again
        conn.new_generation();
        assert_eq!(
            conn.accept_client_ready(Some(2), json!({})),
            ClientReadyOutcome::Accepted
        );
    }

    #[test]
    fn reply_cache_round_trip() {
        let conn = connection();
        let msg: RpcMessage = serde_json::from_str(
            r#"{"v":"0.1","id":"m1","type":"request","gen":{"num":1,"salt":"s"},
                "idempotencyKey":"idem-1"}"#,
        )
        .unwrap();
        let key = conn.dedupe_key(&msg);
        assert_eq!(key, "idem-1");
        assert!(!conn.is_remembered(&key));

        conn.remember(&key);
        conn.put_reply(&key, RpcMessage::reply(&msg, Gen::default(), json!({"ok": true})));
        assert!(conn.is_remembered(&key));
        let cached = conn.cached_reply(&key).unwrap();
        assert_eq!(cached.payload, json!({"ok": true}));
    }

    #[tokio::test]
    async fn cancel_pending_marks_before_cancelling() {
        let conn = connection();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            task_token.cancelled().await;
        });
        conn.add_pending("m1", token, handle);

        assert!(conn.cancel_pending("m1"));
        assert!(conn.is_cancelled("m1"));
        assert!(!conn.cancel_pending("m1"));
    }

    #[tokio::test]
    async fn cancel_subscription_runs_on_cancel_synchronously() {
        let conn = connection();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cancelled.clone();
        let pump = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        conn.add_subscription(
            "m1",
            Some(Box::new(move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
            Some(pump),
        );

        assert!(conn.cancel_subscription("m1"));
        assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!conn.cancel_subscription("m1"));
    }

    #[test]
    fn connection_table_reuses_by_key() {
        let table = ConnectionTable::new();
        let key = ConnectionKey {
            view_id: "view_1".into(),
            client_id: "c_1".into(),
            session_id: "session-1".into(),
        };
        let a = table.get_or_create(key.clone());
        let b = table.get_or_create(key.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }
}
