//! Instrument connection lifecycle.
//!
//! The controller is the TCP server; the instrument firmware dials in. Exactly one peer
//! is active at a time: a newly accepted connection supersedes the previous one, whose
//! listener is cancelled and joined before the new listener starts. Loss of the active
//! peer (EOF, read error, heartbeat watchdog) flips the state back to `Disconnected`
//! and the accept loop keeps waiting for the next peer.
//!
//! Commands go out through a [`ConnectionHandle`], which implements [`CommandSink`].

use crate::config::NetworkConfig;
use crate::error::{AppResult, FplcError};
use crate::network::listener::{ListenerTiming, PeerLoss, TelemetryBus, TelemetryListener};
use crate::network::protocol::{Command, TelemetryEvent};
use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Whether an instrument peer is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No peer.
    Disconnected,
    /// A peer is attached and its listener is running.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Outbound command channel used by the execution engine.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Encode and write one command to the active peer.
    ///
    /// Fails with [`FplcError::NotConnected`] when no peer is attached. Never panics.
    async fn send(&self, command: &Command) -> AppResult<()>;

    /// Whether a peer is currently attached.
    fn is_connected(&self) -> bool;
}

struct PeerWriter {
    generation: u64,
    peer: SocketAddr,
    half: OwnedWriteHalf,
}

struct Shared {
    writer: Mutex<Option<PeerWriter>>,
    state: watch::Sender<ConnectionState>,
    write_timeout: Duration,
}

impl Shared {
    /// Drop the writer if it still belongs to `generation`.
    async fn release(&self, generation: u64) {
        let mut writer = self.writer.lock().await;
        if writer.as_ref().is_some_and(|w| w.generation == generation) {
            *writer = None;
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

/// Cloneable command path to the active peer.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

#[async_trait]
impl CommandSink for ConnectionHandle {
    async fn send(&self, command: &Command) -> AppResult<()> {
        let unit = command.encode()?;
        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            warn!(tag = command.tag(), "Command dropped, instrument not connected");
            return Err(FplcError::NotConnected);
        };

        let result = timeout(
            self.shared.write_timeout,
            writer.half.write_all(unit.as_bytes()),
        )
        .await;

        let reason = match result {
            Ok(Ok(())) => {
                debug!(tag = command.tag(), peer = %writer.peer, "Command sent");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write timed out".to_string(),
        };

        error!(tag = command.tag(), peer = %writer.peer, %reason, "Command write failed");
        // The listener notices the broken stream on its own; stop writing into it now.
        *guard = None;
        self.shared.state.send_replace(ConnectionState::Disconnected);
        Err(FplcError::SendFailed {
            tag: command.tag().to_string(),
            reason,
        })
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

struct ActivePeer {
    generation: u64,
    peer: SocketAddr,
    cancel: watch::Sender<bool>,
    task: JoinHandle<crate::network::listener::DisconnectReason>,
}

impl ActivePeer {
    async fn close(self) {
        self.cancel.send_replace(true);
        match self.task.await {
            Ok(reason) => debug!(peer = %self.peer, ?reason, "Listener joined"),
            Err(e) => warn!(peer = %self.peer, error = %e, "Listener task ended abnormally"),
        }
    }
}

/// Owns the server socket, the accept loop and the active peer.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Bind the server socket and start accepting instrument connections.
    pub async fn start(config: &NetworkConfig, bus: TelemetryBus) -> AppResult<Self> {
        let listener = TcpListener::bind(config.socket_address()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Waiting for instrument connection");

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            writer: Mutex::new(None),
            state,
            write_timeout: config.write_timeout(),
        });
        let timing = ListenerTiming {
            read_timeout: config.read_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            bus,
            timing,
            shutdown_rx,
        ));

        Ok(Self {
            handle: ConnectionHandle { shared },
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    /// Address the server socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Command path to the active peer.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.subscribe_state()
    }

    /// Stop accepting, cancel the active listener and join everything.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
        info!("Connection manager stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    bus: TelemetryBus,
    timing: ListenerTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    let (loss_tx, mut loss_rx) = mpsc::unbounded_channel::<PeerLoss>();
    let mut active: Option<ActivePeer> = None;
    let mut generation: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Some(previous) = active.take() {
                        info!(old = %previous.peer, new = %peer, "New instrument connection supersedes the old one");
                        previous.close().await;
                    }
                    generation += 1;
                    active = Some(
                        attach(stream, peer, generation, &shared, &bus, timing, &loss_tx).await,
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            },
            Some(loss) = loss_rx.recv() => {
                shared.release(loss.generation).await;
                if active.as_ref().is_some_and(|a| a.generation == loss.generation) {
                    if let Some(lost) = active.take() {
                        lost.close().await;
                    }
                    info!(peer = %loss.peer, reason = ?loss.reason, "Awaiting reconnection");
                }
            }
        }
    }

    if let Some(peer) = active.take() {
        peer.close().await;
        bus.publish(TelemetryEvent::Disconnected);
    }
    *shared.writer.lock().await = None;
    shared.state.send_replace(ConnectionState::Disconnected);
}

async fn attach(
    stream: TcpStream,
    peer: SocketAddr,
    generation: u64,
    shared: &Arc<Shared>,
    bus: &TelemetryBus,
    timing: ListenerTiming,
    loss_tx: &mpsc::UnboundedSender<PeerLoss>,
) -> ActivePeer {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle");
    }
    let (read_half, write_half) = stream.into_split();

    *shared.writer.lock().await = Some(PeerWriter {
        generation,
        peer,
        half: write_half,
    });
    shared.state.send_replace(ConnectionState::Connected);
    info!(%peer, generation, "Instrument connected");

    let (cancel, cancel_rx) = watch::channel(false);
    let task = TelemetryListener::new(
        read_half,
        peer,
        generation,
        bus.clone(),
        timing,
        cancel_rx,
        loss_tx.clone(),
    )
    .spawn();

    ActivePeer {
        generation,
        peer,
        cancel,
        task,
    }
}
