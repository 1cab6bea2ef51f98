//! Transport layer.
//!
//! The connection core programs against the [`Transport`] contract only; the
//! four socket callbacks are rendered as [`TransportEvent`]s delivered over an
//! unbounded channel and consumed serially by the connection's pump task,
//! which preserves receive order.
//!
//! [`WsTransport`] is the default implementation, built on
//! `tokio-tungstenite` with a split sink/stream and dedicated read and write
//! tasks so `send` never blocks the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection timeout for the WebSocket handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Events a transport raises toward its connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Session established
    Opened,
    /// One inbound text frame
    Message(String),
    /// Session ended; emitted once per open session
    Closed,
    /// Transport-level error
    Error(String),
}

/// Channel on which a transport delivers its events.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Abstract duplex string channel consumed by the connection core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable id for this transport instance; the parent client keys its
    /// connection map on it.
    fn id(&self) -> u64;

    /// Registers the event sink. Must be called before `connect`.
    fn attach(&self, sink: EventSink);

    /// Establishes a session. Returns false on failure; `reset` must be
    /// called before retrying.
    async fn connect(&self) -> bool;

    /// Closes the current session. Idempotent.
    async fn close(&self);

    /// Discards session state so `connect` may be retried, without raising
    /// a close event.
    fn reset(&self);

    /// Non-blocking best-effort send.
    fn send(&self, payload: String);

    /// Releases all resources; the transport cannot be reused afterwards.
    fn dispose(&self);

    fn is_open(&self) -> bool;

    /// Guard flag for the reconnect loop; at most one loop runs while set.
    fn is_reconnecting(&self) -> bool;

    fn set_reconnecting(&self, reconnecting: bool);
}

struct Session {
    writer_tx: mpsc::UnboundedSender<Message>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    closed_emitted: Arc<AtomicBool>,
}

/// Default transport backed by `tokio-tungstenite`.
pub struct WsTransport {
    id: u64,
    url: String,
    no_data_timeout: Option<Duration>,
    open: Arc<AtomicBool>,
    reconnecting: AtomicBool,
    disposed: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    session: Mutex<Option<Session>>,
}

impl WsTransport {
    /// Creates a transport for `url`. `no_data_timeout` closes the session
    /// when no frame arrives within the window.
    pub fn new(url: impl Into<String>, no_data_timeout: Option<Duration>) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            url: url.into(),
            no_data_timeout,
            open: Arc::new(AtomicBool::new(false)),
            reconnecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            sink: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &*self.sink.lock() {
            let _ = sink.send(event);
        }
    }

    fn teardown(&self) -> Option<Session> {
        let session = self.session.lock().take();
        if let Some(session) = &session {
            session.read_task.abort();
            session.write_task.abort();
        }
        self.open.store(false, Ordering::SeqCst);
        session
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn attach(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn connect(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        if self.open.load(Ordering::SeqCst) {
            return true;
        }

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url)).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                tracing::warn!("transport {} connect to {} failed: {}", self.id, self.url, err);
                self.emit(TransportEvent::Error(err.to_string()));
                return false;
            }
            Err(_) => {
                tracing::warn!("transport {} connect to {} timed out", self.id, self.url);
                return false;
            }
        };

        let (ws_sink, ws_source) = stream.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let closed_emitted = Arc::new(AtomicBool::new(false));

        self.open.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Opened);

        let write_task = tokio::spawn(write_loop(ws_sink, writer_rx));
        let read_task = tokio::spawn(read_loop(
            ws_source,
            writer_tx.clone(),
            self.sink.lock().clone(),
            Arc::clone(&self.open),
            Arc::clone(&closed_emitted),
            self.no_data_timeout,
        ));

        *self.session.lock() = Some(Session {
            writer_tx,
            read_task,
            write_task,
            closed_emitted,
        });
        true
    }

    async fn close(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            self.open.store(false, Ordering::SeqCst);
            return;
        };

        let _ = session.writer_tx.send(Message::Close(None));
        session.read_task.abort();
        self.open.store(false, Ordering::SeqCst);
        if !session.closed_emitted.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::Closed);
        }
    }

    fn reset(&self) {
        if let Some(session) = self.teardown() {
            // suppress the close event; reset is part of a retry cycle
            session.closed_emitted.store(true, Ordering::SeqCst);
        }
    }

    fn send(&self, payload: String) {
        let session = self.session.lock();
        match session.as_ref() {
            Some(session) => {
                if session.writer_tx.send(Message::Text(payload.into())).is_err() {
                    tracing::warn!("transport {} write channel closed, dropping message", self.id);
                }
            }
            None => {
                tracing::warn!("transport {} is closed, dropping outbound message", self.id);
            }
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(session) = self.teardown() {
            session.closed_emitted.store(true, Ordering::SeqCst);
        }
        *self.sink.lock() = None;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::SeqCst);
    }
}

async fn write_loop(mut sink: WsSink, mut writer_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = writer_rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            tracing::warn!("failed to send message: {}", err);
            break;
        }
        if is_close {
            break;
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    writer_tx: mpsc::UnboundedSender<Message>,
    sink: Option<EventSink>,
    open: Arc<AtomicBool>,
    closed_emitted: Arc<AtomicBool>,
    no_data_timeout: Option<Duration>,
) {
    let emit = |event: TransportEvent| {
        if let Some(sink) = &sink {
            let _ = sink.send(event);
        }
    };

    loop {
        let next = match no_data_timeout {
            Some(limit) => match tokio::time::timeout(limit, source.next()).await {
                Ok(item) => item,
                Err(_) => {
                    tracing::warn!("no data received within {:?}, closing transport", limit);
                    break;
                }
            },
            None => source.next().await,
        };

        match next {
            Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(text.to_string())),
            Some(Ok(Message::Ping(data))) => {
                let _ = writer_tx.send(Message::Pong(data));
            }
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::warn!("transport read error: {}", err);
                emit(TransportEvent::Error(err.to_string()));
                break;
            }
            None => break,
        }
    }

    open.store(false, Ordering::SeqCst);
    if !closed_emitted.swap(true, Ordering::SeqCst) {
        emit(TransportEvent::Closed);
    }
}
