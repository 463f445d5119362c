//! HTTP and WebSocket surface.
//!
//! Routes:
//! - `POST /api/bootstrap`                      cookie mint + view token
//! - `GET  /views/{viewId}/mods/index`          frontend mod index
//! - `GET  /views/{viewId}/mods/rescan`         invalidate + index
//! - `GET  /views/{viewId}/mods/load/{modId}/*` mod file stream (no-store)
//! - `GET  /ws`                                 main RPC channel
//! - `GET  /ws/trace`                           devtools trace stream
//! - static mount at `/`, last, so it never shadows API routes.

use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use turnix_core::rpc::{RpcMessage, SocketSession, TransportCtx};
use turnix_core::util::now_monotonic_ms;
use turnix_core::Engine;

#[derive(Clone)]
struct ServerState {
    engine: Arc<Engine>,
    transport: Arc<TransportCtx>,
}

pub async fn serve(engine: Arc<Engine>, port: u16) -> anyhow::Result<()> {
    let state = ServerState {
        transport: engine.transport_ctx(),
        engine,
    };

    let mut app = Router::new()
        .route("/api/bootstrap", post(api_bootstrap))
        .route("/views/:view_id/mods/index", get(mods_index))
        .route("/views/:view_id/mods/rescan", get(mods_rescan))
        .route("/views/:view_id/mods/load/:mod_id/*path", get(mods_load))
        .route("/ws", get(ws_upgrade))
        .route("/ws/trace", get(trace_ws_upgrade));

    // Static mount goes last so it does not shadow API routes.
    let static_dir = state.engine.settings.http.static_dir.clone();
    if Path::new(&static_dir).is_dir() {
        app = app.fallback_service(ServeDir::new(static_dir));
    }

    let app = app.layer(TraceLayer::new_for_http()).with_state(state);

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Turnix listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------- //
// Cookies
// ---------------------------------------------------------------- //

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn client_cookie_header(engine: &Engine, client_id: &str) -> String {
    let http = &engine.settings.http;
    let same_site = match http.cookie_same_site.to_ascii_lowercase().as_str() {
        "strict" => "Strict",
        "none" => "None",
        _ => "Lax",
    };
    let mut cookie = format!(
        "clientId={client_id}; HttpOnly; Path=/; SameSite={same_site}; Max-Age={}",
        http.cookie_max_age_sec
    );
    if http.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
        .into_response()
}

// ---------------------------------------------------------------- //
// Bootstrap
// ---------------------------------------------------------------- //

async fn api_bootstrap(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let engine = &state.engine;
    let cookie_client = cookie_value(&headers, "clientId");
    let client_id = engine.views.ensure_client_id(cookie_client.as_deref());

    let view_kind = body
        .as_ref()
        .and_then(|b| b.0.get("viewKind"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("main")
        .to_string();

    let (view, token) = match engine
        .views
        .get_or_create_view_for_client(&client_id, &view_kind)
    {
        Ok(pair) => pair,
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.wire_code(),
                err.to_string(),
            )
        }
    };

    // Make sure the view can drive menu/chat pipelines right away.
    if let Some(main) = engine.main_session() {
        if !view.is_attached(&main.id) {
            view.attach_session(&main.id);
        }
    }

    let payload = json!({
        "viewId": view.id,
        "viewToken": token,
        "viewKind": view.view_kind,
        "serverGen": view.version(),
    });

    let mut response = Json(payload).into_response();
    if cookie_client.as_deref() != Some(client_id.as_str()) {
        if let Ok(value) = client_cookie_header(engine, &client_id).parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

// ---------------------------------------------------------------- //
// Mods
// ---------------------------------------------------------------- //

async fn mods_index(
    State(state): State<ServerState>,
    UrlPath(view_id): UrlPath<String>,
) -> Response {
    Json(state.engine.mods_index(&view_id)).into_response()
}

async fn mods_rescan(
    State(state): State<ServerState>,
    UrlPath(view_id): UrlPath<String>,
) -> Response {
    if let Err(err) = state.engine.rescan_packs() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.wire_code(),
            err.to_string(),
        );
    }
    Json(state.engine.mods_index(&view_id)).into_response()
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("html") => "text/html; charset=utf-8",
        Some("json") | Some("json5") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

async fn mods_load(
    State(state): State<ServerState>,
    UrlPath((_view_id, mod_id, rel_path)): UrlPath<(String, String, String)>,
) -> Response {
    let file = match state.engine.mod_file_path(&mod_id, &rel_path) {
        Ok(path) => path,
        Err(err) => {
            return error_response(StatusCode::NOT_FOUND, err.wire_code(), err.to_string())
        }
    };
    match tokio::fs::read(&file).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, content_type_for(&file)),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, "BAD_REQUEST", err.to_string()),
    }
}

// ---------------------------------------------------------------- //
// Main RPC WebSocket
// ---------------------------------------------------------------- //

async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let cookie_client = cookie_value(&headers, "clientId");
    upgrade.on_upgrade(move |socket| handle_rpc_socket(socket, state, cookie_client))
}

async fn handle_rpc_socket(
    socket: WebSocket,
    state: ServerState,
    cookie_client: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RpcMessage>();

    // Writer task: everything the dispatch loop emits goes out here.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = SocketSession::new(state.transport.clone(), outbound_tx, cookie_client);
    let mut liveness = tokio::time::interval(std::time::Duration::from_secs(5));

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = session.handle_text(&text).await {
                            tracing::error!(%err, "fatal protocol error; closing socket");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong are ignored
                    Some(Err(err)) => {
                        tracing::debug!(%err, "websocket receive error");
                        break;
                    }
                }
            }
            _ = liveness.tick() => {
                if session.heartbeat_expired(now_monotonic_ms()) {
                    tracing::info!("heartbeat window elapsed; closing socket");
                    break;
                }
            }
        }
    }

    session.handle_close();
    send_task.abort();
}

// ---------------------------------------------------------------- //
// Trace WebSocket
// ---------------------------------------------------------------- //

async fn trace_ws_upgrade(
    State(state): State<ServerState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_trace_socket(socket, state))
}

async fn handle_trace_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let (snapshot, mut records) = state.engine.trace_hub.subscribe();

    // History first, then the live tail.
    for record in snapshot {
        let Ok(text) = serde_json::to_string(&record) else {
            continue;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            record = records.recv() => {
                let Some(record) = record else { break };
                let Ok(text) = serde_json::to_string(&record) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
