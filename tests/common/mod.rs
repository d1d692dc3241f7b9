//! In-process mock of the iWan gateway for integration tests.
//!
//! Speaks WebSocket on 127.0.0.1, verifies the signed handshake against
//! [`API_KEY`]/[`API_SECRET`], records every other request and answers it
//! with whatever the test's responder returns.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use iwan_client::gateway::compute_signature;
use iwan_client::{ClientConfig, Credentials, GatewayEndpoint};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const API_KEY: &str = "test-api-key";
pub const API_SECRET: &str = "test-api-secret";

/// How the mock answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Send this value verbatim as the `error` member
    RawError(Value),
    /// Never answer
    Silent,
    /// Answer after a pause
    Delayed(Duration, Box<Reply>),
    /// Send the same result twice
    Twice(Value),
    /// Drop the connection without answering
    Disconnect,
}

pub type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// What the mock does with the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Verify the signature, reject bad credentials with a JSON-RPC error
    Verify,
    /// Reject every handshake with a JSON-RPC error
    RejectAll,
    /// Close the socket with a policy-violation code
    CloseWithPolicy,
}

struct Shared {
    responder: Responder,
    handshake: Mutex<HandshakeMode>,
    requests: Mutex<Vec<Value>>,
    handshakes: AtomicUsize,
    connections: AtomicUsize,
    pushes: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct MockGateway {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockGateway {
    /// Start on a free port.
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, Arc::new(responder), HandshakeMode::Verify)
    }

    /// Start with a specific handshake behaviour.
    pub async fn start_with_handshake<F>(responder: F, handshake: HandshakeMode) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, Arc::new(responder), handshake)
    }

    /// Start on `addr`, e.g. to come back after [`shutdown`](Self::shutdown).
    pub async fn start_on<F>(addr: SocketAddr, responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let mut attempts = 0;
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) if attempts < 50 => {
                    attempts += 1;
                    tracing::debug!(error = %e, "Port not free yet");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("Could not rebind {}: {}", addr, e),
            }
        };
        Self::serve(listener, Arc::new(responder), HandshakeMode::Verify)
    }

    fn serve(listener: TcpListener, responder: Responder, handshake: HandshakeMode) -> Self {
        let addr = listener.local_addr().unwrap();
        let (pushes, _) = broadcast::channel(256);
        let (kill, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            responder,
            handshake: Mutex::new(handshake),
            requests: Mutex::new(Vec::new()),
            handshakes: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            pushes,
            kill,
            conn_tasks: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let task = tokio::spawn(handle_connection(stream, Arc::clone(&accept_shared)));
                accept_shared.conn_tasks.lock().unwrap().push(task);
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client config pointing at this mock, with test-friendly timings.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: GatewayEndpoint::from_url(&format!("ws://{}/ws/v3", self.addr)).unwrap(),
            backoff_base_ms: 20,
            backoff_cap_ms: 200,
            request_timeout_ms: 2_000,
            handshake_timeout_ms: 2_000,
            sweep_interval_ms: 20,
            ping_interval_ms: 0,
            ..ClientConfig::default()
        }
    }

    /// Change how later handshakes are answered.
    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.shared.handshake.lock().unwrap() = mode;
    }

    /// Push a server-initiated frame to every open connection.
    pub fn push(&self, frame: Value) {
        let _ = self.shared.pushes.send(frame.to_string());
    }

    /// Drop every open connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.shared.kill.send(());
    }

    /// Stop listening and drop every connection; the port is free afterwards.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        let tasks: Vec<JoinHandle<()>> = self.shared.conn_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    /// Every non-handshake request received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r["method"] == method)
            .collect()
    }

    /// Accepted TCP connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Successful handshakes.
    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    /// Wait until `predicate` holds, polling every 10ms.
    pub async fn wait_for<P>(&self, timeout: Duration, predicate: P) -> bool
    where
        P: Fn(&MockGateway) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate(self)
    }
}

/// Credentials the mock accepts.
pub fn credentials() -> Credentials {
    Credentials::new(API_KEY, API_SECRET)
}

/// Echo the request params back as the result.
pub fn echo(request: &Value) -> Reply {
    Reply::Result(request["params"].clone())
}

/// Initialize tracing for a test run; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn response(id: &Value, reply: &Reply) -> Option<String> {
    match reply {
        Reply::Result(value) | Reply::Twice(value) => {
            Some(json!({"jsonrpc": "2.0", "id": id, "result": value}).to_string())
        }
        Reply::Error(code, message) => Some(
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                .to_string(),
        ),
        Reply::RawError(error) => {
            Some(json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string())
        }
        _ => None,
    }
}

fn handshake_is_valid(params: &Value) -> bool {
    let (Some(key), Some(timestamp), Some(signature)) = (
        params["apiKey"].as_str(),
        params["timestamp"].as_str(),
        params["signature"].as_str(),
    ) else {
        return false;
    };
    let material = format!("{}{}", key, timestamp);
    let Ok(expected) = compute_signature(API_SECRET.as_bytes(), material.as_bytes()) else {
        return false;
    };
    key == API_KEY && signature == expected
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut pushes = shared.pushes.subscribe();
    let mut kill = shared.kill.subscribe();
    let mut authenticated = false;

    loop {
        tokio::select! {
            msg = source.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(request) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let id = request["id"].clone();

                if !authenticated {
                    if request["method"] != "authenticate" {
                        continue;
                    }
                    let mode = *shared.handshake.lock().unwrap();
                    match mode {
                        HandshakeMode::CloseWithPolicy => {
                            let _ = out_tx.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Policy,
                                reason: "invalid api key".into(),
                            })));
                            break;
                        }
                        HandshakeMode::Verify if handshake_is_valid(&request["params"]) => {
                            authenticated = true;
                            shared.handshakes.fetch_add(1, Ordering::SeqCst);
                            if let Some(frame) = response(&id, &Reply::Result(json!(true))) {
                                let _ = out_tx.send(Message::Text(frame));
                            }
                        }
                        _ => {
                            if let Some(frame) = response(&id, &Reply::Error(-32001, "invalid signature".into())) {
                                let _ = out_tx.send(Message::Text(frame));
                            }
                        }
                    }
                    continue;
                }

                shared.requests.lock().unwrap().push(request.clone());
                match (shared.responder)(&request) {
                    Reply::Disconnect => break,
                    Reply::Silent => {}
                    Reply::Delayed(pause, inner) => {
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(pause).await;
                            if let Some(frame) = response(&id, &inner) {
                                let _ = out_tx.send(Message::Text(frame));
                            }
                        });
                    }
                    reply @ Reply::Twice(_) => {
                        if let Some(frame) = response(&id, &reply) {
                            let _ = out_tx.send(Message::Text(frame.clone()));
                            let _ = out_tx.send(Message::Text(frame));
                        }
                    }
                    reply => {
                        if let Some(frame) = response(&id, &reply) {
                            let _ = out_tx.send(Message::Text(frame));
                        }
                    }
                }
            }
            push = pushes.recv() => {
                if let Ok(frame) = push {
                    if authenticated {
                        let _ = out_tx.send(Message::Text(frame));
                    }
                }
            }
            _ = kill.recv() => break,
        }
    }

    // Give a queued close frame a moment to go out before the socket drops
    tokio::time::sleep(Duration::from_millis(10)).await;
    writer.abort();
}
