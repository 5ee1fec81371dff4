//! Socket monitor: connection lifecycle events for a channel's socket.
//!
//! ZMQ reports peer connects and disconnects only through a monitor socket,
//! a PAIR socket on an inproc endpoint that receives two-frame events:
//!
//! ```text
//! Frame 0: event id (u16, native endian) + event value (u32, native endian)
//! Frame 1: affected endpoint
//! ```
//!
//! The monitor must be attached before the first bind or connect, or the
//! early events are lost.

use super::ChannelError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

// Event ids from zmq.h
const EVENT_CONNECTED: u16 = 0x0001;
const EVENT_CONNECT_DELAYED: u16 = 0x0002;
const EVENT_CONNECT_RETRIED: u16 = 0x0004;
const EVENT_LISTENING: u16 = 0x0008;
const EVENT_BIND_FAILED: u16 = 0x0010;
const EVENT_ACCEPTED: u16 = 0x0020;
const EVENT_ACCEPT_FAILED: u16 = 0x0040;
const EVENT_CLOSED: u16 = 0x0080;
const EVENT_DISCONNECTED: u16 = 0x0200;
const EVENT_MONITOR_STOPPED: u16 = 0x0400;
const EVENT_HANDSHAKE_SUCCEEDED: u16 = 0x1000;
const EVENT_ALL: i32 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Connected,
    ConnectDelayed,
    ConnectRetried,
    Listening,
    BindFailed,
    Accepted,
    AcceptFailed,
    Closed,
    Disconnected,
    MonitorStopped,
    HandshakeSucceeded,
    Other(u16),
}

impl MonitorEvent {
    pub fn from_raw(id: u16) -> Self {
        match id {
            EVENT_CONNECTED => MonitorEvent::Connected,
            EVENT_CONNECT_DELAYED => MonitorEvent::ConnectDelayed,
            EVENT_CONNECT_RETRIED => MonitorEvent::ConnectRetried,
            EVENT_LISTENING => MonitorEvent::Listening,
            EVENT_BIND_FAILED => MonitorEvent::BindFailed,
            EVENT_ACCEPTED => MonitorEvent::Accepted,
            EVENT_ACCEPT_FAILED => MonitorEvent::AcceptFailed,
            EVENT_CLOSED => MonitorEvent::Closed,
            EVENT_DISCONNECTED => MonitorEvent::Disconnected,
            EVENT_MONITOR_STOPPED => MonitorEvent::MonitorStopped,
            EVENT_HANDSHAKE_SUCCEEDED => MonitorEvent::HandshakeSucceeded,
            other => MonitorEvent::Other(other),
        }
    }

    /// Parse the first frame of a monitor message.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let id = frame.get(..2)?;
        Some(Self::from_raw(u16::from_ne_bytes([id[0], id[1]])))
    }
}

/// PAIR socket receiving events from one monitored socket.
pub struct Monitor {
    socket: zmq::Socket,
}

impl Monitor {
    /// Attach a monitor to `target`. Call before `bind`/`connect`.
    pub fn attach(ctx: &zmq::Context, target: &zmq::Socket) -> Result<Self, ChannelError> {
        let endpoint = format!("inproc://lclstream-mon-{}", Uuid::new_v4());
        target.monitor(&endpoint, EVENT_ALL)?;

        let socket = ctx.socket(zmq::PAIR)?;
        socket.set_linger(0)?;
        socket.connect(&endpoint)?;
        Ok(Self { socket })
    }

    pub fn socket(&self) -> &zmq::Socket {
        &self.socket
    }

    /// Wait up to `timeout` for the next event. `None` when none arrived.
    pub fn recv(&self, timeout: Duration) -> Result<Option<MonitorEvent>, ChannelError> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        if self.socket.poll(zmq::POLLIN, timeout_ms)? == 0 {
            return Ok(None);
        }
        self.try_recv()
    }

    /// Next queued event without blocking.
    pub fn try_recv(&self) -> Result<Option<MonitorEvent>, ChannelError> {
        match self.socket.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => {
                let event = frames
                    .first()
                    .and_then(|f| MonitorEvent::parse(f))
                    .unwrap_or(MonitorEvent::Other(0));
                let endpoint = frames
                    .get(1)
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .unwrap_or_default();
                trace!("monitor: {:?} on {}", event, endpoint);
                Ok(Some(event))
            }
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Connected and disconnected peer counts, shared with the channel handle.
#[derive(Debug, Default)]
pub struct PeerTracker {
    connected: AtomicUsize,
    closed: AtomicUsize,
}

impl PeerTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn peer_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// At least one peer arrived and every peer that arrived has left.
    pub fn all_done(&self) -> bool {
        let connected = self.connected();
        connected > 0 && self.closed() >= connected
    }

    /// Fold one monitor event in. Returns true if the counts changed.
    ///
    /// `Accepted` counts inbound peers of a bound socket and `Connected`
    /// outbound peers of a dialing one; both end with `Disconnected`.
    pub fn observe(&self, event: MonitorEvent) -> bool {
        match event {
            MonitorEvent::Accepted | MonitorEvent::Connected => {
                self.peer_connected();
                true
            }
            MonitorEvent::Disconnected => {
                self.peer_closed();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_frame() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&EVENT_ACCEPTED.to_ne_bytes());
        frame.extend_from_slice(&7u32.to_ne_bytes());
        assert_eq!(MonitorEvent::parse(&frame), Some(MonitorEvent::Accepted));
        assert_eq!(MonitorEvent::parse(&[1]), None);
        assert_eq!(MonitorEvent::from_raw(0x8000), MonitorEvent::Other(0x8000));
    }

    #[test]
    fn test_tracker_needs_a_peer_before_done() {
        let tracker = PeerTracker::new();
        assert!(!tracker.all_done());

        tracker.observe(MonitorEvent::Accepted);
        tracker.observe(MonitorEvent::Accepted);
        tracker.observe(MonitorEvent::Disconnected);
        assert!(!tracker.all_done());

        tracker.observe(MonitorEvent::HandshakeSucceeded);
        tracker.observe(MonitorEvent::Disconnected);
        assert!(tracker.all_done());
        assert_eq!((tracker.connected(), tracker.closed()), (2, 2));
    }
}
