//! In-process mock Home Assistant WebSocket server.
//!
//! Serves `/api/websocket` on an ephemeral port, runs the auth prologue
//! according to [`Auth`], then forwards every text frame from the client to
//! the test and writes whatever the test scripts back.

#![allow(dead_code, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use hab_client::config::ClientConfig;

/// Token the mock accepts in [`Auth::Accept`] mode.
pub const TOKEN: &str = "good-token";

/// How the mock answers the auth prologue.
#[derive(Debug, Clone, Copy)]
pub enum Auth {
    /// `auth_ok` for [`TOKEN`], `auth_invalid` otherwise.
    Accept,
    /// Always `auth_invalid` with this message.
    Reject(&'static str),
    /// Opens with `auth_ok` instead of `auth_required`.
    SkipAuthRequired,
    /// Answers the auth frame with a `result` frame.
    WrongReply,
}

/// Scripted server-side action.
#[derive(Debug)]
pub enum Action {
    /// Send a JSON text frame.
    Send(Value),
    /// Send a raw text frame.
    Raw(String),
    /// Send a close frame and hang up.
    Close,
    /// Stop reading from the socket (no more pongs, no more frames).
    Stall,
}

struct Script {
    auth: Auth,
    from_client: mpsc::UnboundedSender<Value>,
    to_client: mpsc::UnboundedReceiver<Action>,
}

type Slot = Arc<Mutex<Option<Script>>>;

/// Handle the test uses to script the server.
#[derive(Debug)]
pub struct MockServer {
    addr: SocketAddr,
    from_client: mpsc::UnboundedReceiver<Value>,
    to_client: mpsc::UnboundedSender<Action>,
}

impl MockServer {
    /// Starts a server that accepts one connection.
    pub async fn start(auth: Auth) -> Self {
        let (from_tx, from_rx) = mpsc::unbounded_channel();
        let (to_tx, to_rx) = mpsc::unbounded_channel();
        let slot: Slot = Arc::new(Mutex::new(Some(Script {
            auth,
            from_client: from_tx,
            to_client: to_rx,
        })));

        let app = Router::new()
            .route("/api/websocket", get(upgrade))
            .with_state(slot);
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("failed to bind mock server");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local address");
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            from_client: from_rx,
            to_client: to_tx,
        }
    }

    /// Base URL in the form users configure (`http://host:port`).
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client configuration pointing at this server with a short timeout.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.url(), TOKEN).with_request_timeout(Duration::from_secs(5))
    }

    /// Waits for the next command the client sent.
    pub async fn next_command(&mut self) -> Value {
        match tokio::time::timeout(Duration::from_secs(5), self.from_client.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => panic!("mock connection ended"),
            Err(_) => panic!("no command from client within 5s"),
        }
    }

    /// Waits for the next command and returns its id.
    pub async fn next_id(&mut self) -> u64 {
        let command = self.next_command().await;
        command_id(&command)
    }

    /// Scripts one action.
    pub fn act(&self, action: Action) {
        if self.to_client.send(action).is_err() {
            panic!("mock connection is gone");
        }
    }

    /// Sends a successful `result` for `id`.
    pub fn reply(&self, id: u64, result: Value) {
        self.act(Action::Send(json!({
            "id": id,
            "type": "result",
            "success": true,
            "result": result,
        })));
    }

    /// Sends a failed `result` for `id`.
    pub fn reply_error(&self, id: u64, code: &str, message: &str) {
        self.act(Action::Send(json!({
            "id": id,
            "type": "result",
            "success": false,
            "error": {"code": code, "message": message},
        })));
    }

    /// Sends an `event` frame for subscription `id`.
    pub fn event(&self, id: u64, event: Value) {
        self.act(Action::Send(json!({"id": id, "type": "event", "event": event})));
    }
}

/// Extracts the numeric `id` of a client frame.
pub fn command_id(frame: &Value) -> u64 {
    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        panic!("frame without id: {frame}");
    };
    id
}

async fn upgrade(ws: WebSocketUpgrade, State(slot): State<Slot>) -> impl IntoResponse {
    let script = slot.lock().await.take();
    ws.on_upgrade(move |socket| async move {
        if let Some(script) = script {
            run_connection(socket, script).await;
        }
    })
}

type WsTx = SplitSink<WebSocket, Message>;
type WsRx = SplitStream<WebSocket>;

async fn send_json(ws_tx: &mut WsTx, value: &Value) -> bool {
    ws_tx.send(Message::text(value.to_string())).await.is_ok()
}

async fn authenticate(
    ws_tx: &mut WsTx,
    ws_rx: &mut WsRx,
    auth: Auth,
) -> bool {
    if let Auth::SkipAuthRequired = auth {
        send_json(ws_tx, &json!({"type": "auth_ok"})).await;
        return false;
    }
    if !send_json(ws_tx, &json!({"type": "auth_required", "ha_version": "2024.1.0"})).await {
        return false;
    }

    let token = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                break frame
                    .get("access_token")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
            }
            Some(Ok(_)) => {}
            _ => return false,
        }
    };

    let reply = match auth {
        Auth::Accept if token == TOKEN => json!({"type": "auth_ok", "ha_version": "2024.1.0"}),
        Auth::Accept => json!({"type": "auth_invalid", "message": "Invalid access token"}),
        Auth::Reject(message) => json!({"type": "auth_invalid", "message": message}),
        Auth::WrongReply => json!({"id": 1, "type": "result", "success": true}),
        Auth::SkipAuthRequired => return false,
    };
    send_json(ws_tx, &reply).await && matches!(auth, Auth::Accept) && token == TOKEN
}

async fn run_connection(socket: WebSocket, mut script: Script) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    if !authenticate(&mut ws_tx, &mut ws_rx, script.auth).await {
        // Keep the socket open until the client hangs up.
        while let Some(Ok(_)) = ws_rx.next().await {}
        return;
    }

    let mut stalled = false;
    loop {
        tokio::select! {
            msg = ws_rx.next(), if !stalled => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) {
                        let _ = script.from_client.send(frame);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
            action = script.to_client.recv() => match action {
                Some(Action::Send(value)) => {
                    if !send_json(&mut ws_tx, &value).await {
                        break;
                    }
                }
                Some(Action::Raw(text)) => {
                    if ws_tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Action::Close) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                Some(Action::Stall) => stalled = true,
                None => break,
            },
        }
    }
}
