//! Mux configuration.

use std::time::Duration;

use crate::proxy_protocol::DEFAULT_MAX_HEADER_LEN;

/// Default number of matched connections buffered per route.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Whether connections may start with a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    /// Never look for a header; a PROXY line is ordinary payload.
    #[default]
    Off,
    /// Consume a v1 or v2 header if one is present.
    Optional,
}

/// What to do with a connection whose PROXY header fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyErrorAction {
    /// Close the connection.
    #[default]
    Reject,
    /// Ignore the header and match the raw bytes, header included.
    Skip,
}

/// Configuration for a [`Mux`](crate::Mux).
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Matched connections buffered per route; 0 hands each connection over
    /// synchronously.
    pub queue_capacity: usize,
    /// PROXY header handling.
    pub proxy_protocol: ProxyProtocol,
    /// Maximum bytes read while looking for a PROXY header.
    pub proxy_header_max: usize,
    /// Handling of malformed PROXY headers.
    pub on_proxy_error: ProxyErrorAction,
    /// Deadline for all matching on one connection. `None` waits as long
    /// as the matchers do.
    pub sniff_timeout: Option<Duration>,
    /// Shut the whole mux down when the error handler refuses a
    /// per-connection failure. When false the handler is still told about
    /// such failures but cannot stop the service through them.
    pub escalate_on_refusal: bool,
}

impl MuxConfig {
    pub fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            proxy_protocol: ProxyProtocol::Off,
            proxy_header_max: DEFAULT_MAX_HEADER_LEN,
            on_proxy_error: ProxyErrorAction::Reject,
            sniff_timeout: None,
            escalate_on_refusal: true,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_proxy_protocol(mut self, mode: ProxyProtocol) -> Self {
        self.proxy_protocol = mode;
        self
    }

    pub fn with_proxy_header_max(mut self, max: usize) -> Self {
        self.proxy_header_max = max;
        self
    }

    pub fn with_proxy_error_action(mut self, action: ProxyErrorAction) -> Self {
        self.on_proxy_error = action;
        self
    }

    pub fn with_sniff_timeout(mut self, timeout: Duration) -> Self {
        self.sniff_timeout = Some(timeout);
        self
    }

    pub fn with_escalate_on_refusal(mut self, escalate: bool) -> Self {
        self.escalate_on_refusal = escalate;
        self
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::new()
    }
}
