//! Connection configuration.

use std::time::Duration;

/// Options controlling connection, dispatch and reconnect behavior.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Close the transport when no data has been received for this long.
    /// `None` disables the idle check.
    pub socket_no_data_timeout: Option<Duration>,
    /// Whether to automatically reconnect on disconnect
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Number of failed connect attempts before giving up. `None` = unlimited.
    pub max_reconnect_tries: Option<u32>,
    /// Number of failed resubscribe rounds before giving up. `None` = unlimited.
    pub max_resubscribe_tries: Option<u32>,
    /// How many resubscribe requests may be in flight at once after a reconnect
    pub max_concurrent_resubscriptions: usize,
    /// Whether delivered frames retain the raw message string
    pub output_original_data: bool,
    /// Whether a frame matched by a pending request is still offered to subscriptions
    pub continue_on_query_response: bool,
    /// Suppresses the warning log for frames no subscription handles
    pub unhandled_message_expected: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            socket_no_data_timeout: None,
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_tries: None,
            max_resubscribe_tries: None,
            max_concurrent_resubscriptions: 5,
            output_original_data: false,
            continue_on_query_response: false,
            unhandled_message_expected: false,
        }
    }
}
