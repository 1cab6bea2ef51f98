//! Wire format parsing.
//!
//! The connection core treats frames as opaque strings and delegates parsing
//! to a [`Codec`]. The default [`JsonCodec`] parses every frame into a
//! [`serde_json::Value`]; API-specific crates may plug in their own codec
//! behind the same contract.

use serde_json::Value;
use tokio::time::Instant;

use crate::error::{SocketError, SocketResult};

/// Parses raw transport frames into structured values.
pub trait Codec: Send + Sync {
    fn parse(&self, raw: &str) -> SocketResult<Value>;
}

/// Default JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn parse(&self, raw: &str) -> SocketResult<Value> {
        serde_json::from_str(raw).map_err(SocketError::from)
    }
}

/// One parsed message delivered by the transport.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    /// Parsed structured value
    pub data: Value,
    /// Raw message string, retained only when `output_original_data` is set
    pub original: Option<String>,
    /// When the frame was received
    pub received_at: Instant,
    /// Id of the connection that received the frame
    pub connection_id: u64,
}
