//! Subscription tracking for multiplexed streams.
//!
//! A subscription is a live interest in frames matching either an opaque
//! identifier or the original subscribe-request object. The registry keeps
//! them in insertion order; the dispatcher fans each frame out over a
//! snapshot so handlers never run under the registry lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::codec::ParsedFrame;
use crate::error::BoxError;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

type MessageHandler = Box<dyn Fn(&ParsedFrame) -> Result<(), BoxError> + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&BoxError) + Send + Sync>;

/// A live interest in a stream of frames, with a handler.
pub struct Subscription {
    id: u64,
    request: Option<Value>,
    identifier: Option<String>,
    user_subscription: bool,
    confirmed: AtomicBool,
    handler: MessageHandler,
    error_handler: Option<ErrorHandler>,
    cancellation: Mutex<Option<CancellationToken>>,
}

impl Subscription {
    /// Subscription bound to the request object it was created with.
    /// Request-bound subscriptions are re-sent on reconnect.
    pub fn with_request(
        request: Value,
        handler: impl Fn(&ParsedFrame) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            request: Some(request),
            identifier: None,
            user_subscription: true,
            confirmed: AtomicBool::new(false),
            handler: Box::new(handler),
            error_handler: None,
            cancellation: Mutex::new(None),
        }
    }

    /// Subscription matched by an opaque identifier. Identifier-only
    /// subscriptions are assumed to be re-streamed by the remote after a
    /// reconnect and are not resent.
    pub fn with_identifier(
        identifier: impl Into<String>,
        handler: impl Fn(&ParsedFrame) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            request: None,
            identifier: Some(identifier.into()),
            user_subscription: true,
            confirmed: AtomicBool::new(false),
            handler: Box::new(handler),
            error_handler: None,
            cancellation: Mutex::new(None),
        }
    }

    /// Marks this subscription as internal housekeeping; it is excluded from
    /// the user-subscription count that drives auto-close decisions.
    pub fn system(mut self) -> Self {
        self.user_subscription = false;
        self
    }

    /// Callback invoked when the message handler returns an error.
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&BoxError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Box::new(handler));
        self
    }

    /// Token cancelled when the subscription or its connection is closed.
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        *self.cancellation.lock() = Some(token);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> Option<&Value> {
        self.request.as_ref()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn is_user_subscription(&self) -> bool {
        self.user_subscription
    }

    /// Whether the remote acknowledged the subscribe request.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn set_confirmed(&self, confirmed: bool) {
        self.confirmed.store(confirmed, Ordering::SeqCst);
    }

    /// Invokes the handler; an error is logged with the offending frame,
    /// forwarded to the error handler, and never propagated to the caller.
    pub(crate) fn deliver(&self, frame: &ParsedFrame) {
        if let Err(err) = (self.handler)(frame) {
            tracing::error!(
                "subscription {} handler failed on frame {}: {}",
                self.id,
                frame.data,
                err
            );
            if let Some(error_handler) = &self.error_handler {
                error_handler(&err);
            }
        }
    }

    /// Fires the cancellation hook, if one was registered.
    pub(crate) fn cancel(&self) {
        if let Some(token) = self.cancellation.lock().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("request", &self.request)
            .field("user_subscription", &self.user_subscription)
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

/// Ordered set of live subscriptions, guarded by a single mutex.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    /// Appends a subscription. Returns false when the id is already present.
    pub(crate) fn add(&self, subscription: Arc<Subscription>) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.iter().any(|s| s.id == subscription.id) {
            return false;
        }
        subscriptions.push(subscription);
        true
    }

    pub(crate) fn remove(&self, subscription: &Subscription) {
        self.subscriptions
            .lock()
            .retain(|candidate| candidate.id != subscription.id);
    }

    pub(crate) fn get_by_id(&self, id: u64) -> Option<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub(crate) fn get_by_request(
        &self,
        predicate: impl Fn(&Value) -> bool,
    ) -> Option<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .iter()
            .find(|s| s.request().map(&predicate).unwrap_or(false))
            .cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().clone()
    }

    /// Counts user subscriptions only; housekeeping subscriptions are excluded.
    pub(crate) fn count_user(&self) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| s.user_subscription)
            .count()
    }

    /// Fires every subscription's cancellation hook.
    pub(crate) fn cancel_all(&self) {
        for subscription in self.snapshot() {
            subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler(_: &ParsedFrame) -> Result<(), BoxError> {
        Ok(())
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let registry = SubscriptionRegistry::default();
        let subscription = Arc::new(Subscription::with_identifier("ticker", noop_handler));

        assert!(registry.add(Arc::clone(&subscription)));
        assert!(!registry.add(subscription));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_count_user_excludes_system_subscriptions() {
        let registry = SubscriptionRegistry::default();
        registry.add(Arc::new(Subscription::with_identifier("trades", noop_handler)));
        registry.add(Arc::new(
            Subscription::with_identifier("heartbeat", noop_handler).system(),
        ));

        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.count_user(), 1);
    }

    #[test]
    fn test_lookup_by_id_and_request() {
        let registry = SubscriptionRegistry::default();
        let by_request = Arc::new(Subscription::with_request(
            json!({"channel": "book", "symbol": "BTC-USD"}),
            noop_handler,
        ));
        registry.add(Arc::clone(&by_request));

        assert_eq!(registry.get_by_id(by_request.id()).map(|s| s.id()), Some(by_request.id()));
        assert!(registry.get_by_id(u64::MAX).is_none());

        let found = registry
            .get_by_request(|request| request["symbol"] == "BTC-USD")
            .expect("expected a request match");
        assert_eq!(found.id(), by_request.id());
        assert!(registry.get_by_request(|request| request["symbol"] == "ETH-USD").is_none());
    }

    #[test]
    fn test_remove_keeps_insertion_order() {
        let registry = SubscriptionRegistry::default();
        let first = Arc::new(Subscription::with_identifier("a", noop_handler));
        let second = Arc::new(Subscription::with_identifier("b", noop_handler));
        let third = Arc::new(Subscription::with_identifier("c", noop_handler));
        registry.add(Arc::clone(&first));
        registry.add(Arc::clone(&second));
        registry.add(Arc::clone(&third));

        registry.remove(&second);
        let ids: Vec<u64> = registry.snapshot().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![first.id(), third.id()]);
    }

    #[test]
    fn test_cancellation_hook_fires_once() {
        let subscription = Subscription::with_identifier("ticker", noop_handler)
            .with_cancellation(CancellationToken::new());
        let token = subscription.cancellation.lock().clone().unwrap();

        subscription.cancel();
        assert!(token.is_cancelled());
        // second cancel is a no-op; the hook was taken
        subscription.cancel();
    }
}
