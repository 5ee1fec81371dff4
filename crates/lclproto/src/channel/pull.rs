//! Inbound PULL channel that ends when its peers are done.
//!
//! The reactor thread forwards every message into a bounded queue. It stops
//! once at least one peer has connected and every peer that connected has
//! disconnected, after draining whatever those peers left in flight.
//! `recv()` reports `Timeout` when nothing arrives within the configured
//! window; until the first peer shows up that is routine.

use super::monitor::{Monitor, PeerTracker};
use super::socket_config::{create_pull, DRAIN_POLL_MS, POLL_SLICE_MS};
use super::{context_for, establish, ChannelConfig, ChannelError, Role};
use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Delivery = Result<Bytes, ChannelError>;

/// Receiving end of a push/pull pair.
pub struct PullChannel {
    address: String,
    role: Role,
    rx: mpsc::Receiver<Delivery>,
    recv_timeout: Duration,
    peers: Arc<PeerTracker>,
}

impl PullChannel {
    /// Open the socket and bind or dial per `role`.
    pub async fn open(
        address: &str,
        role: Role,
        config: &ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let capacity = usize::try_from(config.recv_buffer).unwrap_or(1).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let peers = PeerTracker::new();

        let name = format!("pull[{}]", address);
        let thread_address = address.to_string();
        let thread_config = config.clone();
        let thread_peers = Arc::clone(&peers);

        std::thread::Builder::new()
            .name("lclstream-pull".to_string())
            .spawn(move || {
                let ctx = context_for(&thread_address);
                let setup = (|| -> Result<_, ChannelError> {
                    let socket = create_pull(&ctx, &thread_config, &name)?;
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
                            return;
                        }
                        reactor(&socket, &monitor, &tx, &thread_peers, &name);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        ready_rx.await.map_err(|_| ChannelError::Closed)??;
        info!("pull channel {} ({}) ready", address, role.as_str());

        Ok(Self {
            address: address.to_string(),
            role,
            rx,
            recv_timeout: config.recv_timeout,
            peers,
        })
    }

    /// Next message.
    ///
    /// - `Ok(Some(bytes))`: a message
    /// - `Ok(None)`: every peer that connected has finished
    /// - `Err(Timeout)`: nothing within the timeout; try again
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        match tokio::time::timeout(self.recv_timeout, self.rx.recv()).await {
            Err(_) => Err(ChannelError::Timeout(self.recv_timeout)),
            Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
        }
    }

    /// All messages until the peers are done. Timeouts are skipped.
    pub fn messages(self) -> impl Stream<Item = Result<Bytes, ChannelError>> {
        let mut channel = self;
        async_stream::stream! {
            loop {
                match channel.recv().await {
                    Ok(Some(bytes)) => yield Ok(bytes),
                    Ok(None) => break,
                    Err(e) if e.is_timeout() => {
                        debug!("{}: waiting for peers (connected={})", channel.address, channel.peers.connected());
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
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

/// The reactor - polls the socket and its monitor until the peers are done
/// or the handle is dropped.
fn reactor(
    socket: &zmq::Socket,
    monitor: &Monitor,
    tx: &mpsc::Sender<Delivery>,
    peers: &PeerTracker,
    name: &str,
) {
    debug!("{}: reactor started", name);

    loop {
        if tx.is_closed() {
            debug!("{}: handle dropped", name);
            return;
        }

        let (data_ready, monitor_ready) = {
            let mut items = [
                socket.as_poll_item(zmq::POLLIN),
                monitor.socket().as_poll_item(zmq::POLLIN),
            ];
            if let Err(e) = zmq::poll(&mut items, POLL_SLICE_MS) {
                warn!("{}: poll failed: {}", name, e);
                let _ = tx.blocking_send(Err(e.into()));
                return;
            }
            (items[0].is_readable(), items[1].is_readable())
        };

        if monitor_ready {
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
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{}: monitor receive failed: {}", name, e);
                        break;
                    }
                }
            }
        }

        if data_ready && !forward_ready(socket, tx, name) {
            return;
        }

        if peers.all_done() {
            drain(socket, tx, name);
            info!("{}: all {} peers finished", name, peers.connected());
            return;
        }
    }
}

/// Forward every message available without blocking. False once the
/// handle is gone or the socket failed.
fn forward_ready(socket: &zmq::Socket, tx: &mpsc::Sender<Delivery>, name: &str) -> bool {
    loop {
        match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => {
                if tx.blocking_send(Ok(Bytes::from(bytes))).is_err() {
                    return false;
                }
            }
            Err(zmq::Error::EAGAIN) => return true,
            Err(e) => {
                warn!("{}: receive failed: {}", name, e);
                let _ = tx.blocking_send(Err(e.into()));
                return false;
            }
        }
    }
}

/// Pick up messages still in flight after the last disconnect.
fn drain(socket: &zmq::Socket, tx: &mpsc::Sender<Delivery>, name: &str) {
    loop {
        match socket.poll(zmq::POLLIN, DRAIN_POLL_MS) {
            Ok(0) => return,
            Ok(_) => {
                if !forward_ready(socket, tx, name) {
                    return;
                }
            }
            Err(e) => {
                warn!("{}: drain poll failed: {}", name, e);
                return;
            }
        }
    }
}
