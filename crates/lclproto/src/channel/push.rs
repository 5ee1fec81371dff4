//! Outbound PUSH channel with blocking backpressure.
//!
//! Usage:
//! ```ignore
//! let mut push = PushChannel::open("tcp://127.0.0.1:5555", Role::Dial(1), &config).await?;
//! push.send(message).await?;   // waits while the send buffer is full
//! push.close().await?;         // flushes queued messages, up to linger
//! ```
//!
//! Dropping a channel without `close()` discards whatever is still queued.

use super::monitor::{Monitor, MonitorEvent, PeerTracker};
use super::socket_config::{create_push, linger_ms};
use super::{context_for, establish, ChannelConfig, ChannelError, Role};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Command sent to the reactor thread
enum PushCommand {
    Send {
        message: Bytes,
        ack: oneshot::Sender<Result<(), ChannelError>>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Single-writer handle to a PUSH socket.
pub struct PushChannel {
    address: String,
    role: Role,
    cmd_tx: mpsc::Sender<PushCommand>,
    peers: Arc<PeerTracker>,
}

impl PushChannel {
    /// Open the socket and bind or dial per `role`.
    ///
    /// Returns once every dial is connected. A dial nobody answers fails
    /// with `ConnectionRefused`.
    pub async fn open(
        address: &str,
        role: Role,
        config: &ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let peers = PeerTracker::new();

        let name = format!("push[{}]", address);
        let thread_address = address.to_string();
        let thread_config = config.clone();
        let thread_peers = Arc::clone(&peers);

        std::thread::Builder::new()
            .name("lclstream-push".to_string())
            .spawn(move || {
                let ctx = context_for(&thread_address);
                let setup = (|| -> Result<_, ChannelError> {
                    let socket = create_push(&ctx, &thread_config, &name)?;
                    let monitor = Monitor::attach(&ctx, &socket)?;
                    establish(
                        &socket,
                        &monitor,
                        &thread_address,
                        role,
                        &thread_config,
                        &thread_peers,
                        &name,
                    )?;
                    Ok((socket, monitor))
                })();

                match setup {
                    Ok((socket, monitor)) => {
                        if ready_tx.send(Ok(())).is_err() {
                            debug!("{}: opener went away before ready", name);
                            return;
                        }
                        reactor(ctx, socket, monitor, cmd_rx, thread_peers, &thread_config, &name);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        ready_rx.await.map_err(|_| ChannelError::Closed)??;
        info!("push channel {} ({}) ready", address, role.as_str());

        Ok(Self {
            address: address.to_string(),
            role,
            cmd_tx,
            peers,
        })
    }

    /// Queue one message. Waits while the send buffer is full.
    ///
    /// Dropping the returned future abandons the send within one send slice.
    pub async fn send(&mut self, message: Bytes) -> Result<(), ChannelError> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(PushCommand::Send { message, ack })
            .await
            .map_err(|_| ChannelError::Closed)?;
        ack_rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Flush queued messages (up to the configured linger) and close.
    pub async fn close(self) -> Result<(), ChannelError> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(PushCommand::Close { ack })
            .await
            .map_err(|_| ChannelError::Closed)?;
        ack_rx.await.map_err(|_| ChannelError::Closed)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peers(&self) -> &PeerTracker {
        &self.peers
    }
}

/// The reactor - owns the socket for the life of the channel.
fn reactor(
    ctx: zmq::Context,
    socket: zmq::Socket,
    monitor: Monitor,
    mut cmd_rx: mpsc::Receiver<PushCommand>,
    peers: Arc<PeerTracker>,
    config: &ChannelConfig,
    name: &str,
) {
    debug!("{}: reactor started", name);

    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            PushCommand::Send { message, ack } => {
                let result = send_blocking(&socket, &message, &ack);
                drain_events(&monitor, &peers, name);
                if let Err(e) = &result {
                    warn!("{}: send failed: {}", name, e);
                }
                let _ = ack.send(result);
            }
            PushCommand::Close { ack } => {
                if let Err(e) = socket.set_linger(linger_ms(config)) {
                    warn!("{}: Failed to set LINGER: {}", name, e);
                }
                drop(monitor);
                drop(socket);
                // Terminating the context blocks until queued messages are
                // delivered or linger expires. The shared inproc context
                // only loses a reference here.
                drop(ctx);
                debug!("{}: closed", name);
                let _ = ack.send(());
                return;
            }
        }
    }

    debug!("{}: handle dropped, discarding queued messages", name);
}

/// Send one message, retrying in short slices while the buffer is full.
fn send_blocking(
    socket: &zmq::Socket,
    message: &[u8],
    ack: &oneshot::Sender<Result<(), ChannelError>>,
) -> Result<(), ChannelError> {
    loop {
        match socket.send(message, 0) {
            Ok(()) => return Ok(()),
            Err(zmq::Error::EAGAIN) => {
                if ack.is_closed() {
                    trace!("send abandoned by caller");
                    return Err(ChannelError::Closed);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn drain_events(monitor: &Monitor, peers: &PeerTracker, name: &str) {
    loop {
        match monitor.try_recv() {
            Ok(Some(event)) => {
                if peers.observe(event) {
                    debug!(
                        "{}: {:?}, peers connected={} closed={}",
                        name,
                        event,
                        peers.connected(),
                        peers.closed()
                    );
                }
                if event == MonitorEvent::MonitorStopped {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("{}: monitor receive failed: {}", name, e);
                return;
            }
        }
    }
}
