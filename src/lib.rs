//! # wsmux
//!
//! A resilient multiplexed WebSocket connection manager for streaming
//! market-data and trading APIs.
//!
//! A [`SocketConnection`] owns a single logical duplex connection to a remote
//! endpoint, fans inbound messages out to a dynamic set of subscriptions,
//! correlates request/response pairs over the same channel, and transparently
//! recovers from transport failures by reconnecting, re-authenticating, and
//! re-subscribing while preserving the client-visible subscription set.
//!
//! # Features
//!
//! - **Multiplexed subscriptions**: one socket, many streams, matched by
//!   identifier or by the original subscribe-request object
//! - **Request/response correlation**: `send_and_wait` resolves with the
//!   first frame matching a predicate, bounded by a deadline
//! - **Auto-reconnect**: bounded retry policy with re-authentication and
//!   bounded-concurrency resubscription
//! - **Lifecycle events**: connection lost/restored/closed, paused activity,
//!   unhandled messages
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wsmux::{SocketConnection, SocketOptions, Subscription, WsTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // `api` implements wsmux::SocketApi for your exchange protocol
//!     let api = Arc::new(MyExchangeApi::new());
//!     let options = Arc::new(SocketOptions::default());
//!     let transport = Arc::new(WsTransport::new(
//!         "wss://stream.example.com/ws",
//!         options.socket_no_data_timeout,
//!     ));
//!
//!     let connection = SocketConnection::new(api, transport, options, "market-data");
//!     connection.connect().await?;
//!
//!     connection.on_connection_lost(|| println!("connection lost"));
//!     connection.on_connection_restored(|outage| {
//!         println!("restored after {:?}", outage);
//!     });
//!
//!     connection.add_subscription(Arc::new(Subscription::with_identifier(
//!         "ticker",
//!         |frame| {
//!             println!("tick: {}", frame.data);
//!             Ok(())
//!         },
//!     )));
//!
//!     let reply = connection
//!         .send_and_wait(
//!             r#"{"op":"auth","id":7}"#.to_string(),
//!             Duration::from_secs(2),
//!             |frame| frame.data["id"] == 7,
//!         )
//!         .await?;
//!     println!("auth reply: {}", reply.data);
//!     Ok(())
//! }
//! ```

/// Parent-client collaborator contract.
pub mod client;

/// Wire format parsing and the parsed frame type.
pub mod codec;

/// Connection facade, dispatcher, and reconnect state machine.
pub mod connection;

/// Error types.
pub mod error;

mod events;

/// Connection configuration.
pub mod options;

mod pending;

/// Subscription tracking.
pub mod subscription;

/// Transport contract and the default tungstenite transport.
pub mod transport;

// Re-export main types
pub use client::SocketApi;
pub use codec::{Codec, JsonCodec, ParsedFrame};
pub use connection::SocketConnection;
pub use error::{BoxError, SocketError, SocketResult};
pub use options::SocketOptions;
pub use subscription::Subscription;
pub use transport::{EventSink, Transport, TransportEvent, WsTransport};
