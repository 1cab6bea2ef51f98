//! Parent-client collaborator contract.
//!
//! The connection core is API-agnostic. Everything protocol-specific
//! (authentication, subscribe/unsubscribe request construction, deciding
//! which frames belong to which subscription) is supplied by the parent
//! client through this trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::ParsedFrame;
use crate::connection::SocketConnection;
use crate::subscription::Subscription;

/// Behavior the parent API client supplies to its connections.
#[async_trait]
pub trait SocketApi: Send + Sync {
    /// Re-authenticates a connection after a reconnect. Only invoked when the
    /// connection was authenticated before the outage.
    async fn authenticate(&self, connection: &SocketConnection) -> bool {
        let _ = connection;
        true
    }

    /// Sends a subscribe request and waits for the remote to confirm it.
    /// Invoked during resubscription with bounded concurrency.
    async fn subscribe_and_wait(
        &self,
        connection: &SocketConnection,
        request: &Value,
        subscription: &Subscription,
    ) -> bool;

    /// Sends an unsubscribe request for a confirmed subscription.
    async fn unsubscribe(&self, connection: &SocketConnection, subscription: &Subscription) {
        let _ = (connection, subscription);
    }

    /// Whether a frame belongs to an identifier-bound subscription.
    fn matches_identifier(
        &self,
        connection: &SocketConnection,
        frame: &ParsedFrame,
        identifier: &str,
    ) -> bool;

    /// Whether a frame belongs to a request-bound subscription.
    fn matches_request(
        &self,
        connection: &SocketConnection,
        frame: &ParsedFrame,
        request: &Value,
    ) -> bool;

    /// Post-processes the parsed payload of a request-bound subscription
    /// before its handler runs.
    fn transform(&self, data: Value) -> Value {
        data
    }

    /// Drops the connection from the parent's `transport id -> connection`
    /// map. Invoked by the connection on terminal close.
    fn remove_connection(&self, connection_id: u64) {
        let _ = connection_id;
    }
}
