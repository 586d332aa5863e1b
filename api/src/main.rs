use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use keyframe_stream_common::config::Config;
use keyframe_stream_common::protocol::ServerMessage;
use keyframe_stream_engine::{
    pipeline_from_name, AuthValidator, CaptureInferencePipeline, ClientFrame, SessionController,
    SessionSettings, StaticTokenValidator,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Close code sent when the connection token is rejected.
const CLOSE_UNAUTHORIZED: u16 = 4001;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    settings: SessionSettings,
    auth: Arc<dyn AuthValidator>,
    pipeline: Arc<dyn CaptureInferencePipeline>,
    active_sessions: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    token: String,
}

// ---------------------------------------------------------------------------
// Wire adapters
// ---------------------------------------------------------------------------

/// Map a WebSocket message onto the session's transport-agnostic frame.
/// Protocol-level ping/pong is answered by the socket itself and skipped.
fn client_frame(msg: Result<Message, axum::Error>) -> Option<Result<ClientFrame, axum::Error>> {
    match msg {
        Ok(Message::Binary(data)) => Some(Ok(ClientFrame::Binary(Bytes::from(data)))),
        Ok(Message::Text(text)) => Some(Ok(ClientFrame::Text(text))),
        Ok(Message::Close(_)) => Some(Ok(ClientFrame::Close)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(e)),
    }
}

fn encode(msg: ServerMessage) -> Result<Message, axum::Error> {
    serde_json::to_string(&msg)
        .map(Message::Text)
        .map_err(axum::Error::new)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": state.active_sessions.load(Ordering::Relaxed),
    }))
}

/// GET <stream_path>?token=...: upgrade to the frame streaming socket
async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.token, state))
}

async fn handle_socket(mut socket: WebSocket, token: String, state: Arc<AppState>) {
    let controller = SessionController::new(
        state.settings.clone(),
        Arc::clone(&state.auth),
        Arc::clone(&state.pipeline),
    );

    let session = match controller.authenticate(&token) {
        Ok(session) => session,
        Err(e) => {
            let close = Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: Cow::from("Unauthorized"),
            }));
            if let Err(send_err) = socket.send(close).await {
                warn!(error = %send_err, "failed to send auth rejection");
            }
            info!(error = %e, "stream connection rejected");
            return;
        }
    };

    let active = state.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
    info!(identity = %session.identity(), active, "stream session started");

    let (sender, receiver) = socket.split();
    let inbound = receiver.filter_map(|msg| future::ready(client_frame(msg)));
    let outbound = sender.with(|msg: ServerMessage| future::ready(encode(msg)));

    let identity = session.identity().clone();
    let final_stats = session.run(inbound, outbound).await;

    let active = state.active_sessions.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(
        identity = %identity,
        active,
        frames_received = final_stats.frames_received,
        keyframes_detected = final_stats.keyframes_detected,
        "stream session closed"
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn router(state: Arc<AppState>, stream_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(stream_path, get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let Some(pipeline) = pipeline_from_name(&config.inference.backend) else {
        eprintln!("Unknown inference backend: {}", config.inference.backend);
        std::process::exit(1);
    };
    info!(backend = pipeline.name(), "inference backend ready");

    if config.auth.dev_token.as_deref().is_some_and(|t| !t.is_empty()) {
        warn!(identity = %config.auth.dev_identity, "development token enabled");
    }

    let state = Arc::new(AppState {
        settings: SessionSettings::from_config(&config),
        auth: Arc::new(StaticTokenValidator::from_config(&config.auth)),
        pipeline,
        active_sessions: AtomicUsize::new(0),
    });

    let app = router(state, &config.server.stream_path);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    info!(addr, stream_path = %config.server.stream_path, "keyframe stream server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
    info!("server stopped");
}
