#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{
    Path, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// One HTTP request the mock room server saw, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Hit {
    Join { room: String },
    Message { room: String, client: String, body: Value },
    Leave { room: String, client: String },
    ChannelDelete { room: String, client: String },
    IceServers,
}

#[derive(Clone)]
struct AppState {
    join: Arc<AsyncMutex<Value>>,
    message_response: Arc<AsyncMutex<String>>,
    ice_servers: Arc<AsyncMutex<Value>>,
    hits: mpsc::UnboundedSender<Hit>,
    frames: mpsc::UnboundedSender<String>,
    to_client: Arc<AsyncMutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
}

pub struct MockRendezvous {
    pub addr: SocketAddr,
    state: AppState,
    hits: AsyncMutex<mpsc::UnboundedReceiver<Hit>>,
    frames: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockRendezvous {
    pub async fn start() -> Self {
        let (hits_tx, hits_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let state = AppState {
            join: Arc::new(AsyncMutex::new(Value::Null)),
            message_response: Arc::new(AsyncMutex::new(json!({ "result": "SUCCESS" }).to_string())),
            ice_servers: Arc::new(AsyncMutex::new(json!({ "iceServers": [] }))),
            hits: hits_tx,
            frames: frames_tx,
            to_client: Arc::new(AsyncMutex::new(None)),
        };

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            state,
            hits: AsyncMutex::new(hits_rx),
            frames: AsyncMutex::new(frames_rx),
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn channel_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn channel_post_url(&self) -> String {
        format!("http://{}/ws", self.addr)
    }

    /// A successful join response pointing back at this server.
    pub fn join_response(&self, is_initiator: bool, messages: &[&str]) -> Value {
        json!({
            "result": "SUCCESS",
            "params": {
                "room_id": "test-room",
                "client_id": if is_initiator { "1001" } else { "2002" },
                "is_initiator": if is_initiator { "true" } else { "false" },
                "wss_url": self.channel_url(),
                "wss_post_url": self.channel_post_url(),
                "pc_config": "{\"iceServers\":[{\"urls\":[\"stun:stun.example.org:19302\"]}]}",
                "messages": messages,
            }
        })
    }

    pub async fn set_join(&self, value: Value) {
        *self.state.join.lock().await = value;
    }

    pub async fn set_message_result(&self, result: &str) {
        self.set_message_response(&json!({ "result": result }).to_string())
            .await;
    }

    /// Raw body returned by the message endpoint from now on.
    pub async fn set_message_response(&self, body: &str) {
        *self.state.message_response.lock().await = body.to_string();
    }

    pub async fn set_ice_servers(&self, value: Value) {
        *self.state.ice_servers.lock().await = value;
    }

    pub async fn next_hit(&self) -> Hit {
        let mut hits = self.hits.lock().await;
        timeout(WAIT, hits.recv())
            .await
            .expect("timed out waiting for http request")
            .expect("hit channel closed")
    }

    /// Next text frame a client sent, parsed as JSON.
    pub async fn next_frame(&self) -> Value {
        let mut frames = self.frames.lock().await;
        let text = timeout(WAIT, frames.recv())
            .await
            .expect("timed out waiting for websocket frame")
            .expect("frame channel closed");
        serde_json::from_str(&text).expect("frame is json")
    }

    /// Waits for a `send` command and returns the typed message it carries.
    pub async fn next_sent_message(&self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["cmd"] == "send" {
                let msg = frame["msg"].as_str().expect("msg is a string");
                return serde_json::from_str(msg).expect("msg is json");
            }
        }
    }

    async fn client_sender(&self) -> mpsc::UnboundedSender<WsMessage> {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(tx) = self.state.to_client.lock().await.clone() {
                return tx;
            }
            assert!(Instant::now() < deadline, "no websocket client connected");
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn push_raw(&self, text: &str) {
        let tx = self.client_sender().await;
        tx.send(WsMessage::Text(text.to_string()))
            .expect("websocket client gone");
    }

    pub async fn push_binary(&self, data: Vec<u8>) {
        let tx = self.client_sender().await;
        tx.send(WsMessage::Binary(data))
            .expect("websocket client gone");
    }

    /// Delivers a typed message to the connected client inside an envelope.
    pub async fn push_message(&self, message: Value) {
        let envelope = json!({ "msg": message.to_string(), "error": "" });
        self.push_raw(&envelope.to_string()).await;
    }

    pub async fn close_socket(&self) {
        let tx = self.client_sender().await;
        let _ = tx.send(WsMessage::Close(None));
    }
}

impl Drop for MockRendezvous {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/join/:room", post(join))
        .route("/message/:room/:client", post(message))
        .route("/leave/:room/:client", post(leave))
        .route("/turn", post(ice_servers))
        .route("/ws", get(ws_handler))
        .route("/ws/:room/:client", delete(channel_delete))
        .with_state(state)
}

async fn join(State(state): State<AppState>, Path(room): Path<String>) -> impl IntoResponse {
    debug!("stub: join {room}");
    let _ = state.hits.send(Hit::Join { room });
    let body = state.join.lock().await.clone();
    if body.is_null() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "join unavailable").into_response();
    }
    Json(body).into_response()
}

async fn message(
    State(state): State<AppState>,
    Path((room, client)): Path<(String, String)>,
    body: String,
) -> String {
    debug!("stub: message {room}/{client}: {body}");
    let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
    let _ = state.hits.send(Hit::Message { room, client, body });
    state.message_response.lock().await.clone()
}

async fn leave(
    State(state): State<AppState>,
    Path((room, client)): Path<(String, String)>,
) -> StatusCode {
    debug!("stub: leave {room}/{client}");
    let _ = state.hits.send(Hit::Leave { room, client });
    StatusCode::OK
}

async fn channel_delete(
    State(state): State<AppState>,
    Path((room, client)): Path<(String, String)>,
) -> StatusCode {
    debug!("stub: channel delete {room}/{client}");
    let _ = state.hits.send(Hit::ChannelDelete { room, client });
    StatusCode::OK
}

async fn ice_servers(State(state): State<AppState>) -> Json<Value> {
    let _ = state.hits.send(Hit::IceServers);
    Json(state.ice_servers.lock().await.clone())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    debug!("stub: websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    *state.to_client.lock().await = Some(tx);

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                let _ = state.frames.send(text);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    *state.to_client.lock().await = None;
    send_task.abort();
}
