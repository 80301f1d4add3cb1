//! portmuxd configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use portmux::{MuxConfig, ProxyProtocol, DEFAULT_QUEUE_CAPACITY};

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the shared port listens on.
    pub listen_addr: SocketAddr,

    /// Matched connections buffered per route (0 = synchronous hand-off).
    pub queue_capacity: usize,

    /// Accept PROXY headers from a load balancer in front.
    pub proxy_protocol: ProxyProtocol,

    /// Deadline for matching one connection.
    pub sniff_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("PORTMUX_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("PORTMUX_LISTEN_ADDR must be a socket address (host:port).")?;

        let queue_capacity: usize = lookup("PORTMUX_QUEUE_CAPACITY")
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_QUEUE_CAPACITY must be a non-negative integer.")?
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);

        let proxy_protocol = match lookup("PORTMUX_PROXY_PROTOCOL")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("off") | Some("0") | Some("false") => ProxyProtocol::Off,
            Some("optional") | Some("1") | Some("true") => ProxyProtocol::Optional,
            Some(other) => bail!("PORTMUX_PROXY_PROTOCOL must be 'off' or 'optional', got '{other}'."),
        };

        let sniff_timeout = lookup("PORTMUX_SNIFF_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("PORTMUX_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let log_level = lookup("PORTMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            queue_capacity,
            proxy_protocol,
            sniff_timeout,
            log_level,
        })
    }

    /// The mux settings this configuration asks for.
    pub fn mux_config(&self) -> MuxConfig {
        let mut config = MuxConfig::new()
            .with_queue_capacity(self.queue_capacity)
            .with_proxy_protocol(self.proxy_protocol)
            // Per-connection failures never stop the service.
            .with_escalate_on_refusal(false);
        if let Some(timeout) = self.sniff_timeout {
            config = config.with_sniff_timeout(timeout);
        }
        config
    }
}
