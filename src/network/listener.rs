//! Telemetry listener: reads the peer's byte stream, decodes units and fans them out.
//!
//! One listener task runs per connected peer. Reads use a short timeout so the task
//! re-checks its cancel signal and the heartbeat watchdog even when the line is quiet.
//! On EOF, a read error or watchdog expiry the listener publishes
//! [`TelemetryEvent::Disconnected`], reports the loss to the connection manager and exits.

use crate::acquisition::AcquisitionTap;
use crate::network::protocol::{FrameDecoder, TelemetryEvent};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_LEN: usize = 4096;

/// Fan-out point for decoded telemetry.
///
/// Every event is handed to the acquisition tap synchronously before it is broadcast.
/// The tap's queue is the controller's ordered input; broadcast subscribers are
/// observers and may lag without affecting it.
#[derive(Debug, Clone)]
pub struct TelemetryBus {
    sender: broadcast::Sender<TelemetryEvent>,
    tap: Option<AcquisitionTap>,
}

impl TelemetryBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, tap: None }
    }

    /// Route events through an acquisition gate into the ordered controller feed.
    pub fn with_acquisition_tap(mut self, tap: AcquisitionTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Dispatch one event.
    pub fn publish(&self, event: TelemetryEvent) {
        if let Some(tap) = &self.tap {
            tap.dispatch(&event);
        }
        if self.sender.send(event).is_err() {
            trace!("No telemetry subscribers");
        }
    }
}

/// Why a listener stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the stream.
    EndOfStream,
    /// Socket read failed.
    ReadError(String),
    /// No heartbeat within the watchdog window.
    HeartbeatTimeout,
    /// Stopped by the connection manager (peer superseded or shutdown).
    Cancelled,
}

impl DisconnectReason {
    /// Whether the peer was lost, as opposed to deliberately dropped.
    pub fn is_loss(&self) -> bool {
        !matches!(self, DisconnectReason::Cancelled)
    }
}

/// Loss report sent to the connection manager.
#[derive(Debug, Clone)]
pub struct PeerLoss {
    /// Connection generation the listener served.
    pub generation: u64,
    /// Peer address.
    pub peer: SocketAddr,
    /// Why the listener stopped.
    pub reason: DisconnectReason,
}

/// Tracks the time since the last heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatWatchdog {
    last_heartbeat: Instant,
    timeout: Duration,
}

impl HeartbeatWatchdog {
    /// Start a watchdog; the connection itself counts as the first heartbeat.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_heartbeat: Instant::now(),
            timeout,
        }
    }

    /// Record a heartbeat.
    pub fn feed(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Whether the window has passed without a heartbeat.
    pub fn expired(&self) -> bool {
        self.last_heartbeat.elapsed() > self.timeout
    }

    /// Time since the last heartbeat.
    pub fn silence(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }
}

/// Listener timing.
#[derive(Debug, Clone, Copy)]
pub struct ListenerTiming {
    /// Maximum wait on a single read before re-checking cancel and watchdog.
    pub read_timeout: Duration,
    /// Heartbeat watchdog window.
    pub heartbeat_timeout: Duration,
}

/// Reads and decodes one peer's telemetry.
pub struct TelemetryListener<R> {
    reader: R,
    peer: SocketAddr,
    generation: u64,
    bus: TelemetryBus,
    timing: ListenerTiming,
    decoder: FrameDecoder,
    cancel: watch::Receiver<bool>,
    loss: mpsc::UnboundedSender<PeerLoss>,
}

impl<R> TelemetryListener<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Build a listener for one peer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: R,
        peer: SocketAddr,
        generation: u64,
        bus: TelemetryBus,
        timing: ListenerTiming,
        cancel: watch::Receiver<bool>,
        loss: mpsc::UnboundedSender<PeerLoss>,
    ) -> Self {
        Self {
            reader,
            peer,
            generation,
            bus,
            timing,
            decoder: FrameDecoder::new(),
            cancel,
            loss,
        }
    }

    /// Run the listener on its own task.
    pub fn spawn(self) -> JoinHandle<DisconnectReason> {
        tokio::spawn(self.run())
    }

    /// Read until the peer is lost or the listener is cancelled.
    pub async fn run(mut self) -> DisconnectReason {
        info!(peer = %self.peer, generation = self.generation, "Telemetry listener started");
        let mut watchdog = HeartbeatWatchdog::new(self.timing.heartbeat_timeout);
        let mut buf = vec![0u8; READ_BUFFER_LEN];

        let reason = loop {
            if *self.cancel.borrow() {
                break DisconnectReason::Cancelled;
            }

            let read = tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        break DisconnectReason::Cancelled;
                    }
                    continue;
                }
                read = timeout(self.timing.read_timeout, self.reader.read(&mut buf)) => read,
            };

            match read {
                Ok(Ok(0)) => break DisconnectReason::EndOfStream,
                Ok(Ok(n)) => {
                    for event in self.decoder.decode(&buf[..n]) {
                        if event == TelemetryEvent::Heartbeat {
                            watchdog.feed();
                        }
                        self.bus.publish(event);
                    }
                }
                Ok(Err(e)) => break DisconnectReason::ReadError(e.to_string()),
                Err(_) => trace!(peer = %self.peer, "Read timeout, re-polling"),
            }

            if watchdog.expired() {
                warn!(
                    peer = %self.peer,
                    silence = ?watchdog.silence(),
                    "Heartbeat watchdog expired"
                );
                break DisconnectReason::HeartbeatTimeout;
            }
        };

        if reason.is_loss() {
            warn!(peer = %self.peer, ?reason, "Instrument connection lost");
            self.bus.publish(TelemetryEvent::Disconnected);
            let report = PeerLoss {
                generation: self.generation,
                peer: self.peer,
                reason: reason.clone(),
            };
            if self.loss.send(report).is_err() {
                debug!("Connection manager gone, loss not reported");
            }
        } else {
            debug!(peer = %self.peer, "Telemetry listener cancelled");
        }

        reason
    }
}
