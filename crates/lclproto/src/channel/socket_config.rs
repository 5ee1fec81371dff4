//! Centralized ZMQ socket configuration for push and pull channels.
//!
//! All socket setup goes through these helpers so both ends of a transfer
//! agree on buffering and shutdown behavior.
//!
//! ## Options Applied
//!
//! - `SNDHWM`/`RCVHWM` from the transport config; a full PUSH buffer makes
//!   `send` block, which is the only backpressure a pipeline sees
//! - `LINGER` = 0 while open; `close()` raises it to the configured value so
//!   only an orderly close flushes queued messages
//! - `SNDTIMEO` sliced short so a blocked send can notice its caller left
//! - `RECONNECT_IVL` = 1s for responsive reconnection

use super::{ChannelConfig, ChannelError};
use tracing::warn;

/// Reconnect interval in milliseconds
pub const DEFAULT_RECONNECT_IVL_MS: i32 = 1000;

/// Slice of a blocking send, in milliseconds. Between slices the reactor
/// checks whether the caller is still waiting.
pub const SEND_SLICE_MS: i32 = 50;

/// Poll interval of the pull reactor, in milliseconds.
pub const POLL_SLICE_MS: i64 = 100;

/// How long a finished pull channel keeps polling for stragglers.
pub const DRAIN_POLL_MS: i64 = 50;

/// Create and configure a PUSH socket.
pub fn create_push(
    ctx: &zmq::Context,
    config: &ChannelConfig,
    name: &str,
) -> Result<zmq::Socket, ChannelError> {
    let socket = ctx.socket(zmq::PUSH)?;
    configure_common(&socket, name);

    if let Err(e) = socket.set_sndhwm(config.send_buffer) {
        warn!("{}: Failed to set SNDHWM: {}", name, e);
    }
    if let Err(e) = socket.set_sndtimeo(SEND_SLICE_MS) {
        warn!("{}: Failed to set SNDTIMEO: {}", name, e);
    }

    Ok(socket)
}

/// Create and configure a PULL socket.
pub fn create_pull(
    ctx: &zmq::Context,
    config: &ChannelConfig,
    name: &str,
) -> Result<zmq::Socket, ChannelError> {
    let socket = ctx.socket(zmq::PULL)?;
    configure_common(&socket, name);

    if let Err(e) = socket.set_rcvhwm(config.recv_buffer) {
        warn!("{}: Failed to set RCVHWM: {}", name, e);
    }

    Ok(socket)
}

fn configure_common(socket: &zmq::Socket, name: &str) {
    if let Err(e) = socket.set_linger(0) {
        warn!("{}: Failed to set LINGER: {}", name, e);
    }
    if let Err(e) = socket.set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS) {
        warn!("{}: Failed to set RECONNECT_IVL: {}", name, e);
    }
}

/// Linger in the unit ZMQ expects. Saturates at `i32::MAX` ms.
pub fn linger_ms(config: &ChannelConfig) -> i32 {
    i32::try_from(config.linger.as_millis()).unwrap_or(i32::MAX)
}
