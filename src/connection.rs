//! Connection facade, message dispatcher, and reconnect state machine.
//!
//! A [`SocketConnection`] owns one logical duplex channel to a remote
//! endpoint. Inbound frames are parsed and routed to either a waiting
//! request/response correlation or the matching subscriptions; transport
//! failures are recovered by reconnecting, re-authenticating, and
//! re-subscribing while the client-visible subscription set is preserved.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::SocketApi;
use crate::codec::{Codec, JsonCodec, ParsedFrame};
use crate::error::{SocketError, SocketResult};
use crate::events::ConnectionEvents;
use crate::options::SocketOptions;
use crate::pending::PendingRegistry;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transport::{Transport, TransportEvent};

/// Wall-clock limit for one frame's handler sequence before a warning is logged
const SLOW_PROCESSING_THRESHOLD: Duration = Duration::from_millis(500);

/// A resilient multiplexed connection to a streaming endpoint.
///
/// Created by the parent API client, one per transport. The connection
/// survives transport outages; it is destroyed by [`close`](Self::close) or
/// when the retry policy gives up.
pub struct SocketConnection {
    id: u64,
    tag: Mutex<String>,
    authenticated: AtomicBool,
    connected: AtomicBool,
    should_reconnect: AtomicBool,
    paused_activity: AtomicBool,
    lost_triggered: AtomicBool,
    close_emitted: AtomicBool,
    reconnect_try: AtomicU32,
    resubscribe_try: AtomicU32,
    disconnect_time: Mutex<Option<Instant>>,
    transport: Arc<dyn Transport>,
    subscriptions: SubscriptionRegistry,
    pending: PendingRegistry,
    events: ConnectionEvents,
    api: Arc<dyn SocketApi>,
    codec: Arc<dyn Codec>,
    options: Arc<SocketOptions>,
}

impl SocketConnection {
    /// Creates a connection over `transport` with the default JSON codec.
    ///
    /// Spawns the event pump; must be called from within a tokio runtime.
    pub fn new(
        api: Arc<dyn SocketApi>,
        transport: Arc<dyn Transport>,
        options: Arc<SocketOptions>,
        tag: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_codec(api, transport, options, Arc::new(JsonCodec), tag)
    }

    /// Creates a connection with a custom codec.
    pub fn with_codec(
        api: Arc<dyn SocketApi>,
        transport: Arc<dyn Transport>,
        options: Arc<SocketOptions>,
        codec: Arc<dyn Codec>,
        tag: impl Into<String>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.attach(event_tx);

        let connection = Arc::new(Self {
            id: transport.id(),
            tag: Mutex::new(tag.into()),
            authenticated: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(true),
            paused_activity: AtomicBool::new(false),
            lost_triggered: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
            reconnect_try: AtomicU32::new(0),
            resubscribe_try: AtomicU32::new(0),
            disconnect_time: Mutex::new(None),
            transport,
            subscriptions: SubscriptionRegistry::default(),
            pending: PendingRegistry::default(),
            events: ConnectionEvents::default(),
            api,
            codec,
            options,
        });

        tokio::spawn(Self::pump(Arc::clone(&connection), event_rx));
        connection
    }

    /// Establishes the initial transport session.
    pub async fn connect(&self) -> SocketResult<()> {
        if self.transport.connect().await {
            Ok(())
        } else {
            Err(SocketError::ConnectionFailed(
                "transport failed to open".to_string(),
            ))
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> String {
        self.tag.lock().clone()
    }

    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.tag.lock() = tag.into();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Marks the connection authenticated; authenticated connections are
    /// re-authenticated before resubscription after an outage.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect.load(Ordering::SeqCst)
    }

    pub fn is_paused_activity(&self) -> bool {
        self.paused_activity.load(Ordering::SeqCst)
    }

    /// Remote-declared data-flow suspension (e.g. maintenance) while the
    /// socket stays open. Idempotent on equal values; logs and raises the
    /// paired event on change.
    pub fn set_paused_activity(&self, paused: bool) {
        if self.paused_activity.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        if paused {
            tracing::info!("connection {} activity paused", self.id);
            self.events.emit_activity_paused();
        } else {
            tracing::info!("connection {} activity unpaused", self.id);
            self.events.emit_activity_unpaused();
        }
    }

    /// Number of in-flight request/response correlations.
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    /// Appends a subscription. Returns false when it is already registered.
    pub fn add_subscription(&self, subscription: Arc<Subscription>) -> bool {
        self.subscriptions.add(subscription)
    }

    pub fn get_subscription(&self, id: u64) -> Option<Arc<Subscription>> {
        self.subscriptions.get_by_id(id)
    }

    pub fn get_subscription_by_request(
        &self,
        predicate: impl Fn(&Value) -> bool,
    ) -> Option<Arc<Subscription>> {
        self.subscriptions.get_by_request(predicate)
    }

    /// Number of user subscriptions; housekeeping subscriptions are excluded.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.count_user()
    }

    /// Closes a single subscription: fires its cancellation hook,
    /// unsubscribes at the remote when confirmed, and closes the whole
    /// connection when no other user subscription remains.
    pub async fn close_subscription(&self, subscription: &Subscription) {
        if self.transport.is_open() {
            subscription.cancel();
            if subscription.is_confirmed() {
                self.api.unsubscribe(self, subscription).await;
            }
            let remaining = self
                .subscriptions
                .snapshot()
                .iter()
                .filter(|s| s.is_user_subscription() && s.id() != subscription.id())
                .count();
            if remaining == 0 {
                self.close().await;
            }
        }
        self.subscriptions.remove(subscription);
    }

    // ── Sending ─────────────────────────────────────────────────────────────

    /// Forwards `data` to the transport. Best-effort; delivery failures
    /// surface as a transport close.
    pub fn send(&self, data: String) {
        tracing::debug!("connection {} sending: {}", self.id, data);
        self.transport.send(data);
    }

    /// Serializes `message` as JSON and sends it.
    pub fn send_json<T: Serialize>(&self, message: &T) -> SocketResult<()> {
        let payload = serde_json::to_string(message)?;
        self.send(payload);
        Ok(())
    }

    /// Sends `data` and waits for a frame matching `predicate`, up to
    /// `timeout`. The returned future resolves exactly once: with the
    /// matched frame, or with [`SocketError::RequestTimeout`] when the
    /// deadline expires or the connection closes first.
    pub async fn send_and_wait(
        &self,
        data: String,
        timeout: Duration,
        predicate: impl Fn(&ParsedFrame) -> bool + Send + Sync + 'static,
    ) -> SocketResult<ParsedFrame> {
        let request = self.pending.register(Box::new(predicate), timeout);
        self.send(data);
        match request.wait().await {
            Some(frame) => Ok(frame),
            None => Err(SocketError::RequestTimeout),
        }
    }

    // ── Events ──────────────────────────────────────────────────────────────

    /// The transport dropped and the reconnect policy took over. Fired at
    /// most once per outage.
    pub fn on_connection_lost(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.events.on_connection_lost(listener);
    }

    /// The connection recovered from an outage; carries the outage duration.
    pub fn on_connection_restored(&self, listener: impl Fn(Duration) + Send + Sync + 'static) {
        self.events.on_connection_restored(listener);
    }

    /// The connection ended while the consumer still wanted it open.
    pub fn on_connection_closed(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.events.on_connection_closed(listener);
    }

    /// Terminal close; fired exactly once per connection.
    pub fn on_closed(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.events.on_closed(listener);
    }

    pub fn on_activity_paused(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.events.on_activity_paused(listener);
    }

    pub fn on_activity_unpaused(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.events.on_activity_unpaused(listener);
    }

    /// A parsed frame no pending request or subscription claimed.
    pub fn on_unhandled_message(&self, listener: impl Fn(&ParsedFrame) + Send + Sync + 'static) {
        self.events.on_unhandled_message(listener);
    }

    // ── Closing ─────────────────────────────────────────────────────────────

    /// Closes the connection and releases the transport. Idempotent; the
    /// `closed` event fires exactly once.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.subscriptions.cancel_all();
        self.transport.close().await;
        self.transport.dispose();
        self.pending.fail_all();
        self.terminal_close(false);
    }

    fn terminal_close(&self, emit_connection_closed: bool) {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.api.remove_connection(self.id);
        if emit_connection_closed {
            self.events.emit_connection_closed();
        }
        tracing::info!("connection {} closed", self.id);
        self.events.emit_closed();
    }

    // ── Transport event pump ────────────────────────────────────────────────

    async fn pump(
        connection: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Opened => connection.on_open(),
                TransportEvent::Message(raw) => connection.handle_message(raw).await,
                TransportEvent::Closed => Self::on_close(&connection).await,
                TransportEvent::Error(err) => {
                    tracing::warn!("connection {} transport error: {}", connection.id, err);
                }
            }
        }
    }

    fn on_open(&self) {
        self.reconnect_try.store(0, Ordering::SeqCst);
        self.paused_activity.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("connection {} transport open", self.id);
    }

    async fn on_close(connection: &Arc<Self>) {
        connection.connected.store(false, Ordering::SeqCst);
        connection.pending.fail_all();

        if connection.options.auto_reconnect && connection.should_reconnect() {
            if connection.transport.is_reconnecting() {
                return;
            }
            connection.transport.set_reconnecting(true);
            *connection.disconnect_time.lock() = Some(Instant::now());
            if !connection.lost_triggered.swap(true, Ordering::SeqCst) {
                tracing::info!("connection {} lost, reconnecting", connection.id);
                connection.events.emit_connection_lost();
            }
            let connection = Arc::clone(connection);
            tokio::spawn(async move {
                connection.reconnect_loop().await;
            });
        } else {
            let wanted_open = connection.should_reconnect();
            connection.terminal_close(wanted_open && !connection.options.auto_reconnect);
        }
    }

    // ── Message dispatch ────────────────────────────────────────────────────

    async fn handle_message(&self, raw: String) {
        let received_at = Instant::now();
        if raw.is_empty() {
            return;
        }

        let data = match self.codec.parse(&raw) {
            Ok(value) => value,
            Err(_) => {
                // bare scalar frames arrive unquoted; retry as a JSON string
                match self.codec.parse(&format!("\"{raw}\"")) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::debug!(
                            "connection {} dropping unparseable frame: {}",
                            self.id,
                            err
                        );
                        return;
                    }
                }
            }
        };

        let frame = ParsedFrame {
            data,
            original: self.options.output_original_data.then(|| raw.clone()),
            received_at,
            connection_id: self.id,
        };

        let handled_by_request = self.pending.check_and_sweep(&frame);
        if handled_by_request && !self.options.continue_on_query_response {
            return;
        }

        let subscriptions = self.subscriptions.snapshot();
        let started = Instant::now();
        let mut delivered = false;
        for subscription in subscriptions {
            let matched = match subscription.request() {
                Some(request) => self.api.matches_request(self, &frame, request),
                None => subscription
                    .identifier()
                    .map(|identifier| self.api.matches_identifier(self, &frame, identifier))
                    .unwrap_or(false),
            };
            if !matched {
                continue;
            }
            delivered = true;

            if subscription.request().is_some() {
                let mut event = frame.clone();
                event.data = self.api.transform(event.data);
                subscription.deliver(&event);
            } else {
                subscription.deliver(&frame);
            }
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_PROCESSING_THRESHOLD {
            tracing::warn!(
                "connection {} message processing slow: handlers took {:?}",
                self.id,
                elapsed
            );
        }

        if !handled_by_request && !delivered {
            if !self.options.unhandled_message_expected {
                tracing::warn!(
                    "connection {} received unhandled message: {}",
                    self.id,
                    frame.data
                );
            }
            self.events.emit_unhandled_message(&frame);
        }
    }

    // ── Reconnect state machine ─────────────────────────────────────────────

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.reconnect_try.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(self.options.reconnect_interval).await;
            }
            if !self.should_reconnect() {
                break;
            }

            self.transport.reset();
            if !self.transport.connect().await {
                let tries = self.reconnect_try.fetch_add(1, Ordering::SeqCst) + 1;
                self.resubscribe_try.store(0, Ordering::SeqCst);
                tracing::warn!("connection {} reconnect attempt {} failed", self.id, tries);
                if self.retries_exhausted(tries, self.options.max_reconnect_tries) {
                    break;
                }
                continue;
            }

            let disconnected_at = self.disconnect_time.lock().take();
            if !self.process_reconnect().await {
                let tries = self.resubscribe_try.fetch_add(1, Ordering::SeqCst) + 1;
                *self.disconnect_time.lock() = disconnected_at;
                tracing::warn!(
                    "connection {} resubscribe attempt {} failed",
                    self.id,
                    tries
                );
                if self.retries_exhausted(tries, self.options.max_resubscribe_tries) {
                    break;
                }
                if self.transport.is_open() {
                    self.transport.close().await;
                }
                continue;
            }

            self.resubscribe_try.store(0, Ordering::SeqCst);
            if self.lost_triggered.swap(false, Ordering::SeqCst) {
                let outage = disconnected_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                tracing::info!("connection {} restored after {:?}", self.id, outage);
                self.events.emit_connection_restored(outage);
            }
            break;
        }
        self.transport.set_reconnecting(false);
    }

    fn retries_exhausted(&self, tries: u32, cap: Option<u32>) -> bool {
        let Some(max) = cap else {
            return false;
        };
        if tries < max {
            return false;
        }
        tracing::error!(
            "connection {} giving up after {} failed attempts",
            self.id,
            tries
        );
        self.terminal_close(true);
        true
    }

    /// Re-authenticates and re-subscribes after a successful reconnect.
    /// Returns false when anything fails, which closes the transport and
    /// retries the whole cycle.
    async fn process_reconnect(&self) -> bool {
        if self.is_authenticated() {
            if !self.transport.is_open() {
                return false;
            }
            if !self.api.authenticate(self).await {
                tracing::warn!("connection {} re-authentication failed", self.id);
                return false;
            }
        }

        // identifier-only subscriptions are re-streamed by the remote
        let to_resubscribe: Vec<Arc<Subscription>> = self
            .subscriptions
            .snapshot()
            .into_iter()
            .filter(|subscription| subscription.request().is_some())
            .collect();

        let batch_size = self.options.max_concurrent_resubscriptions.max(1);
        for group in to_resubscribe.chunks(batch_size) {
            if !self.transport.is_open() {
                return false;
            }
            let requests = group.iter().filter_map(|subscription| {
                subscription
                    .request()
                    .map(|request| self.api.subscribe_and_wait(self, request, subscription))
            });
            let results = futures_util::future::join_all(requests).await;
            if results.contains(&false) {
                return false;
            }
            if !self.transport.is_open() {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("id", &self.id)
            .field("tag", &self.tag())
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .field("should_reconnect", &self.should_reconnect())
            .field("subscriptions", &self.subscriptions.snapshot().len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
