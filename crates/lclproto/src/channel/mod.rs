//! Push/pull message channels over ZMQ.
//!
//! Architecture: reactor threads own the sockets.
//! - Each channel's socket lives on one dedicated OS thread
//! - Async callers talk to it over bounded tokio channels
//! - A socket monitor on the same thread tracks peer connects/disconnects
//!
//! ZMQ sockets are not thread-safe, and the blocking calls (a saturated
//! `send`, a dial waiting for its peer) must not stall the tokio runtime.

pub mod monitor;
pub mod pull;
pub mod push;
pub mod socket_config;

pub use monitor::{MonitorEvent, PeerTracker};
pub use pull::PullChannel;
pub use push::PushChannel;

use lclconf::TransportConfig;
use monitor::Monitor;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection refused by {address}: {reason}")]
    ConnectionRefused { address: String, reason: String },

    #[error("No message within {0:?}")]
    Timeout(Duration),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("ZMQ error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("Channel closed")]
    Closed,

    #[error("Failed to spawn channel thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}

/// Whether a channel binds and waits for peers or connects out to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listen,
    /// Connect this many times to the same address.
    Dial(u32),
}

impl Role {
    /// `0` means listen, anything else dials that many times.
    pub fn from_ndial(ndial: u32) -> Self {
        if ndial == 0 {
            Role::Listen
        } else {
            Role::Dial(ndial)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Listen => "listen",
            Role::Dial(_) => "dial",
        }
    }
}

/// Channel settings, usually built from `[transport]` config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub send_buffer: i32,
    pub recv_buffer: i32,
    pub recv_timeout: Duration,
    pub linger: Duration,
    /// How long one dial waits for the connection before giving up.
    pub dial_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for ChannelConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            send_buffer: config.send_buffer,
            recv_buffer: config.recv_buffer,
            recv_timeout: Duration::from_millis(config.recv_timeout_ms),
            // Negative linger means wait forever, as in ZMQ
            linger: if config.linger_ms < 0 {
                Duration::from_millis(i32::MAX as u64)
            } else {
                Duration::from_millis(config.linger_ms as u64)
            },
            dial_timeout: Duration::from_millis(config.recv_timeout_ms),
        }
    }
}

impl ChannelConfig {
    pub fn with_send_buffer(mut self, messages: i32) -> Self {
        self.send_buffer = messages;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

/// Context for a socket on `address`.
///
/// `inproc` endpoints only rendezvous inside one context, so they share a
/// process-wide one that is never terminated. Other transports get a context
/// per channel; terminating it in `close()` is what waits out the linger.
pub(crate) fn context_for(address: &str) -> zmq::Context {
    static SHARED: OnceLock<zmq::Context> = OnceLock::new();
    if is_inproc(address) {
        SHARED.get_or_init(zmq::Context::new).clone()
    } else {
        zmq::Context::new()
    }
}

fn is_inproc(address: &str) -> bool {
    address.starts_with("inproc://")
}

fn refused(address: &str, reason: impl Into<String>) -> ChannelError {
    ChannelError::ConnectionRefused {
        address: address.to_string(),
        reason: reason.into(),
    }
}

/// Bind or dial `socket` per `role`. Runs on the reactor thread.
///
/// Each dial blocks until the monitor reports the connection. A refused or
/// closed attempt fails at once instead of letting ZMQ retry in the
/// background.
///
/// The monitor sees no events on `inproc` endpoints. An `inproc` dial counts
/// as connected once `connect` succeeds and messages queue until a listener
/// binds; a listening `inproc` pull never learns its peers are done.
fn establish(
    socket: &zmq::Socket,
    monitor: &Monitor,
    address: &str,
    role: Role,
    config: &ChannelConfig,
    peers: &PeerTracker,
    name: &str,
) -> Result<(), ChannelError> {
    match role {
        Role::Listen => {
            socket.bind(address)?;
            debug!("{}: listening on {}", name, address);
            Ok(())
        }
        Role::Dial(count) => {
            for n in 0..count {
                socket.connect(address)?;
                if is_inproc(address) {
                    peers.peer_connected();
                    debug!("{}: dial {}/{} attached to {}", name, n + 1, count, address);
                    continue;
                }
                let deadline = Instant::now() + config.dial_timeout;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(refused(address, "timed out waiting for connection"));
                    }
                    match monitor.recv(remaining)? {
                        Some(MonitorEvent::Connected) => {
                            peers.peer_connected();
                            break;
                        }
                        Some(MonitorEvent::ConnectRetried) | Some(MonitorEvent::Closed) => {
                            return Err(refused(address, "no listener"));
                        }
                        Some(other) => trace!("{}: dial {} saw {:?}", name, n, other),
                        None => {}
                    }
                }
                debug!("{}: dial {}/{} connected to {}", name, n + 1, count, address);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_ndial() {
        assert_eq!(Role::from_ndial(0), Role::Listen);
        assert_eq!(Role::from_ndial(3), Role::Dial(3));
    }

    #[test]
    fn test_inproc_shares_one_context() {
        let a = context_for("inproc://frames");
        let b = context_for("inproc://other");
        let pull = a.socket(zmq::PULL).unwrap();
        pull.bind("inproc://context-check").unwrap();
        let push = b.socket(zmq::PUSH).unwrap();
        push.connect("inproc://context-check").unwrap();
        push.send("hello", 0).unwrap();
        pull.set_rcvtimeo(1000).unwrap();
        assert_eq!(pull.recv_bytes(0).unwrap(), b"hello");
    }

    #[test]
    fn test_config_from_transport() {
        let transport = TransportConfig {
            send_buffer: 4,
            linger_ms: -1,
            ..Default::default()
        };
        let config = ChannelConfig::from(&transport);
        assert_eq!(config.send_buffer, 4);
        assert_eq!(config.recv_timeout, Duration::from_millis(5000));
        assert_eq!(socket_config::linger_ms(&config), i32::MAX);
    }
}
