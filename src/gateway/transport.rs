//! WebSocket Transport Layer
//!
//! Single responsibility: Connect to a WebSocket and move text frames in both directions.
//! No knowledge of JSON-RPC, authentication, or correlation.
//!
//! A [`Transport`] is used directly during the handshake (strict
//! request/response on one task). Once the connection is authenticated it is
//! turned into a [`Link`]: one writer task that owns the sink and serializes
//! every outbound frame, and one reader task that feeds inbound frames to a
//! single [`FrameHandler`], awaiting each before reading the next.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// How long `Link::close` waits for the close frame to be flushed.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Longest wait a deadline is allowed to express (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, with timeouts too large for an `Instant` clamped to the far future.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(FAR_FUTURE)
}

/// One inbound event seen while driving the transport by hand.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    /// Peer closed (close code, reason) or the stream ended (`None`)
    Closed(Option<(u16, String)>),
}

/// Why a link stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEnd {
    /// The gateway sent a close frame or the stream ended
    ClosedByPeer(Option<(u16, String)>),
    /// Reading or writing the socket failed
    Failed(String),
    /// We closed it
    Local,
}

/// Single consumer of inbound frames.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, text: String);
}

/// A connected WebSocket transport.
///
/// Can only be constructed via `Transport::connect()`.
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
    activity: Arc<ActivityClock>,
}

impl Transport {
    /// Connect to a WebSocket endpoint.
    ///
    /// Fails with `Network` on DNS/TCP/TLS/upgrade failure and with
    /// `Timeout` if the socket is not open within `deadline`.
    pub async fn connect(url: &Url, deadline: Duration) -> Result<Self, ClientError> {
        debug!(host = ?url.host_str(), "Connecting to WebSocket");

        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Network(format!("Failed to build request: {}", e)))?;

        let (ws, _) = tokio::time::timeout(deadline, connect_async(request))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("WebSocket connect exceeded {:?}", deadline))
            })?
            .map_err(|e| ClientError::Network(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(host = ?url.host_str(), "WebSocket connected");
        Ok(Self {
            sink,
            stream,
            activity: Arc::new(ActivityClock::new()),
        })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Network(format!("Failed to send: {}", e)))
    }

    /// Receive the next text frame or the close event.
    ///
    /// Binary frames holding UTF-8 are treated as text; pings are answered by
    /// tungstenite.
    pub async fn recv(&mut self) -> Result<Inbound, ClientError> {
        loop {
            let msg = self.stream.next().await;
            self.activity.touch();
            match msg {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Inbound::Text(text)),
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => return Ok(Inbound::Closed(close_details(frame))),
                Some(Ok(_)) => continue, // ping, pong, raw frames
                Some(Err(e)) => {
                    return Err(ClientError::Network(format!("WebSocket error: {}", e)))
                }
                None => return Ok(Inbound::Closed(None)),
            }
        }
    }

    /// Hand the socket to background tasks.
    ///
    /// Every inbound frame goes to `handler`, in arrival order.
    pub fn into_link(
        self,
        handler: Arc<dyn FrameHandler>,
        queue_capacity: usize,
        ping_interval: Option<Duration>,
    ) -> Link {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (done_tx, done_rx) = mpsc::channel(2);

        let writer = tokio::spawn(writer_loop(self.sink, rx, ping_interval, done_tx.clone()));
        let reader = tokio::spawn(reader_loop(
            self.stream,
            handler,
            Arc::clone(&self.activity),
            done_tx,
        ));

        Link {
            outbound: Outbound { tx },
            activity: self.activity,
            reader,
            writer: Some(writer),
            done: done_rx,
        }
    }

    /// Send a close frame and drop the socket.
    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Cloneable handle for queueing outbound frames.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// Queue a text frame; never waits.
    ///
    /// Fails with `ConnectionLost` once the writer is gone.
    pub fn send(&self, text: String) -> Result<(), ClientError> {
        self.tx.try_send(Message::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ClientError::Network("Outbound queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => ClientError::ConnectionLost,
        })
    }
}

/// A live, task-driven connection.
///
/// Dropping a `Link` aborts both tasks, so the socket is released on every
/// exit path.
pub struct Link {
    outbound: Outbound,
    activity: Arc<ActivityClock>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    done: mpsc::Receiver<LinkEnd>,
}

impl Link {
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Time of the last inbound frame of any kind.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.get()
    }

    /// Shared clock that keeps ticking after the link is handed around.
    pub fn activity_clock(&self) -> Arc<ActivityClock> {
        Arc::clone(&self.activity)
    }

    /// Wait until either task stops.
    pub async fn ended(&mut self) -> LinkEnd {
        self.done.recv().await.unwrap_or(LinkEnd::Local)
    }

    /// Flush a close frame and stop both tasks. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = self.outbound.tx.try_send(Message::Close(None));
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                debug!("Writer did not flush close frame in time");
            }
            writer.abort();
        }
        self.reader.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Writer task: the only place frames are written.
async fn writer_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Message>,
    ping_interval: Option<Duration>,
    done: mpsc::Sender<LinkEnd>,
) {
    let mut ping = ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(deadline_after(period), period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    let end = loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    break LinkEnd::Local;
                };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    break LinkEnd::Failed(format!("Failed to send: {}", e));
                }
                if closing {
                    break LinkEnd::Local;
                }
            }
            _ = tick(&mut ping) => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break LinkEnd::Failed(format!("Failed to ping: {}", e));
                }
            }
        }
    };

    debug!(end = ?end, "Writer loop ended");
    let _ = sink.close().await;
    let _ = done.send(end).await;
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Reader task: the only consumer of inbound frames.
async fn reader_loop(
    mut stream: WsStream,
    handler: Arc<dyn FrameHandler>,
    activity: Arc<ActivityClock>,
    done: mpsc::Sender<LinkEnd>,
) {
    debug!("Reader loop started");

    let end = loop {
        let msg = stream.next().await;
        activity.touch();
        match msg {
            Some(Ok(Message::Text(text))) => handler.on_frame(text).await,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => handler.on_frame(text).await,
                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let details = close_details(frame);
                debug!(close = ?details, "Gateway closed connection");
                break LinkEnd::ClosedByPeer(details);
            }
            Some(Ok(_)) => {} // ping/pong handled by tungstenite
            Some(Err(e)) => break LinkEnd::Failed(format!("WebSocket error: {}", e)),
            None => break LinkEnd::ClosedByPeer(None),
        }
    };

    debug!(end = ?end, "Reader loop ended");
    let _ = done.send(end).await;
}

fn close_details(frame: Option<CloseFrame<'_>>) -> Option<(u16, String)> {
    frame.map(|f| (u16::from(f.code), f.reason.into_owned()))
}

/// Close codes that mean "your credentials were refused".
pub fn is_auth_close(code: u16) -> bool {
    code == u16::from(CloseCode::Policy) || code == 4001 || code == 4003
}

/// Millisecond timestamp of the last inbound frame.
#[derive(Debug)]
pub struct ActivityClock(AtomicI64);

impl ActivityClock {
    fn new() -> Self {
        Self(AtomicI64::new(Utc::now().timestamp_millis()))
    }

    fn touch(&self) {
        self.0.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn get(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0.load(Ordering::Relaxed))
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// An `Outbound` whose text frames come out of the returned receiver.
    pub fn outbound_pair(capacity: usize) -> (Outbound, mpsc::Receiver<String>) {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity);
        let (text_tx, text_rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Message::Text(text) = msg {
                    if text_tx.send(text).await.is_err() {
                        break;
                    }
                }
            }
        });
        (Outbound { tx }, text_rx)
    }
}
