//! PixelPlace Authority Server
//!
//! Holds the canonical pixel grid and serializes writes from all clients.
//!
//! ## Protocol
//!
//! Messages are JSON with the following format:
//! ```json
//! { "type": "hello", "client_id": "5c1f..." }
//! { "type": "write", "x": 3, "y": 7, "color": [255, 0, 0], "seq": 12 }
//! ```
//! A `hello` is answered with a full `snapshot`. Every accepted `write` is
//! broadcast to all clients, the writer included, as a `delta` carrying the
//! writer's id and sequence number; that echo is the writer's acknowledgment.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use pixelplace_core::{
    ClientMessage, ColorValue, GridCoordinate, ServerMessage, SnapshotEntry,
    config::DEFAULT_GRID_SIZE,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server configuration
const CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_PORT: u16 = 3030;

/// Settings read from the environment at startup
#[derive(Debug, Clone, PartialEq)]
struct ServerConfig {
    addr: SocketAddr,
    width: u32,
    height: u32,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse_or<V: std::str::FromStr>(key: &str, raw: Option<String>, default: V) -> V {
            match raw {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!("Ignoring invalid {}={:?}", key, raw);
                    default
                }),
                None => default,
            }
        }

        let default_addr = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT));
        let width: u32 =
            parse_or("PIXELPLACE_WIDTH", lookup("PIXELPLACE_WIDTH"), DEFAULT_GRID_SIZE);
        let height: u32 =
            parse_or("PIXELPLACE_HEIGHT", lookup("PIXELPLACE_HEIGHT"), DEFAULT_GRID_SIZE);
        Self {
            addr: parse_or("PIXELPLACE_ADDR", lookup("PIXELPLACE_ADDR"), default_addr),
            width: if width == 0 { DEFAULT_GRID_SIZE } else { width },
            height: if height == 0 { DEFAULT_GRID_SIZE } else { height },
        }
    }
}

/// Shared application state
struct AppState {
    width: u32,
    height: u32,
    /// Painted cells; anything missing is the default color
    pixels: DashMap<GridCoordinate, ColorValue>,
    /// Accepted writes, in acceptance order per cell
    tx: broadcast::Sender<ServerMessage>,
}

impl AppState {
    fn new(width: u32, height: u32) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            width,
            height,
            pixels: DashMap::new(),
            tx,
        }
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    /// Current grid as a snapshot message
    fn snapshot(&self) -> ServerMessage {
        let entries = self
            .pixels
            .iter()
            .map(|cell| SnapshotEntry {
                x: cell.key().x,
                y: cell.key().y,
                color: *cell.value(),
            })
            .collect();
        ServerMessage::Snapshot {
            width: self.width,
            height: self.height,
            entries,
        }
    }

    /// Store a write and broadcast it.
    ///
    /// The cell's map entry stays locked across the broadcast, so deltas for
    /// one cell go out in the order they were stored.
    fn apply_write(
        &self,
        x: u32,
        y: u32,
        color: ColorValue,
        origin: &str,
        seq: u64,
    ) -> Result<(), String> {
        if !self.contains(x, y) {
            return Err(format!(
                "({}, {}) is outside the {}x{} grid",
                x, y, self.width, self.height
            ));
        }
        let mut cell = self.pixels.entry(GridCoordinate::new(x, y)).or_insert(color);
        *cell = color;
        let _ = self.tx.send(ServerMessage::Delta {
            x,
            y,
            color,
            origin: Some(origin.to_string()),
            origin_seq: Some(seq),
        });
        drop(cell);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixelplace_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let state = Arc::new(AppState::new(config.width, config.height));

    info!(
        "PixelPlace authority listening on {} ({}x{} grid)",
        config.addr, config.width, config.height
    );
    info!("WebSocket endpoint: ws://localhost:{}/ws", config.addr.port());

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app(state)).await
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Index page
async fn index() -> &'static str {
    "PixelPlace Authority - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            None
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New connection: {}", conn_id);

    let (mut sender, mut receiver) = socket.split();
    // Client id announced in hello; writes are attributed to it
    let mut client_id: Option<String> = None;
    let mut deltas: Option<broadcast::Receiver<ServerMessage>> = None;

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(ClientMessage::Hello { client_id: id }) => {
                            // Subscribe before snapshotting so no write falls in between
                            deltas = Some(state.tx.subscribe());
                            info!("Connection {} is client {}", conn_id, id);
                            client_id = Some(id);
                            Some(state.snapshot())
                        }
                        Ok(ClientMessage::Write { x, y, color, seq }) => {
                            let origin = client_id.as_deref().unwrap_or(&conn_id);
                            debug!("Write #{} from {}: ({}, {}) = {}", seq, origin, x, y, color);
                            state
                                .apply_write(x, y, color, origin, seq)
                                .err()
                                .map(|message| ServerMessage::Error { message })
                        }
                        Err(e) => {
                            warn!("Invalid message from {}: {}", conn_id, e);
                            Some(ServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            })
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None, // Ignore binary/ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn_id, e);
                        break;
                    }
                };
                if let Some(out) = reply.as_ref().and_then(encode) {
                    if sender.send(out).await.is_err() {
                        break;
                    }
                }
            }

            // Forward accepted writes
            delta = async {
                match &mut deltas {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let out = match delta {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Fell behind the broadcast; resync the client from scratch
                        warn!("Connection {} lagged by {} deltas, resyncing", conn_id, missed);
                        state.snapshot()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(out) = encode(&out) {
                    if sender.send(out).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!("Connection closed: {}", conn_id);
}
