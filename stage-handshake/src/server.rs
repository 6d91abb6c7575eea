//! The protocol server: one tokio task per live listener.
//!
//! ```text
//!  discovery (udp, fixed port)
//!       │ greeting
//!       ▼
//!  transfer listener (udp, fresh port)  ── one per session, idle-bounded
//!       │ last packet counted
//!       ▼
//!  bulk listener (tcp, fresh port)      ── accepts once, stage C then D
//! ```
//!
//! Every task owns a [`ListenerGuard`]; when the task ends for any reason
//! the guard releases the port and expires whatever secret the task was
//! still serving.  Handler logic lives in [`crate::handlers`]; this module
//! only moves frames between sockets and registry transactions.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::config::{ConfigError, ServerConfig};
use crate::handlers::{self, StageError, TransferOutcome};
use crate::listener::{
    serve_datagrams, CloseReason, DatagramHandler, Dispatch, ListenerGuard, ShutdownSignal,
};
use crate::packet::{padded_len, Frame};
use crate::registry::{ListenerKind, SessionRegistry};
use crate::socket::{FrameStream, Socket, SocketError};

/// Errors from starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration was rejected before anything was bound.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The discovery socket could not be bound.
    #[error("cannot bind discovery socket: {0}")]
    Bind(#[from] SocketError),
}

/// State every listener task shares.
#[derive(Debug, Clone)]
struct Shared {
    registry: SessionRegistry,
    config: Arc<ServerConfig>,
}

/// A running server.  Dropping it without [`shutdown`](Self::shutdown)
/// also stops every listener, but does not wait for them.
#[derive(Debug)]
pub struct ProtocolServer {
    registry: SessionRegistry,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    alive: mpsc::Receiver<()>,
}

impl ProtocolServer {
    /// Bind the discovery socket and start serving.
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let socket = Socket::bind(SocketAddr::new(config.bind_ip, config.discovery_port)).await?;
        let local_addr = socket.local_addr;
        let registry = SessionRegistry::with_port_range(config.port_range.clone());
        registry.transaction(|t| t.register_listener(local_addr.port(), ListenerKind::Discovery));

        let (stop, stop_rx) = watch::channel(false);
        let (alive_tx, alive) = mpsc::channel(1);
        let shutdown = ShutdownSignal::new(stop_rx, alive_tx);

        let shared = Shared {
            registry: registry.clone(),
            config: Arc::new(config),
        };
        let guard = ListenerGuard::new(registry.clone(), local_addr.port(), ListenerKind::Discovery, None)
            .tracked(shutdown.clone());
        let handler = DiscoveryHandler {
            shared,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(run_datagram_listener(socket, handler, None, guard, shutdown));

        log::info!("[a] listening on {local_addr}");
        Ok(Self {
            registry,
            local_addr,
            stop,
            alive,
        })
    }

    /// Address of the discovery listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Ports currently bound, discovery port included.
    pub fn active_listeners(&self) -> Vec<(u16, ListenerKind)> {
        self.registry.listeners()
    }

    /// Stop every listener and wait until all ports are released.
    pub async fn shutdown(mut self) {
        log::info!("[a] shutting down {}", self.local_addr);
        let _ = self.stop.send(true);
        // Each task holds a sender; `None` means the last one is gone.
        while self.alive.recv().await.is_some() {}
        log::info!("[a] all listeners closed");
    }
}

async fn run_datagram_listener<H: DatagramHandler>(
    socket: Socket,
    mut handler: H,
    idle: Option<std::time::Duration>,
    guard: ListenerGuard,
    mut shutdown: ShutdownSignal,
) {
    let reason = serve_datagrams(&socket, &mut handler, idle, &mut shutdown).await;
    match reason {
        CloseReason::Completed => log::debug!("[{}] port {} finished", handler.tag(), guard.port()),
        other => log::debug!("[{}] port {} closed: {other:?}", handler.tag(), guard.port()),
    }
    drop(guard);
}

// ---------------------------------------------------------------------------
// Stage A
// ---------------------------------------------------------------------------

struct DiscoveryHandler {
    shared: Shared,
    shutdown: ShutdownSignal,
}

impl DatagramHandler for DiscoveryHandler {
    fn tag(&self) -> &'static str {
        "a"
    }

    fn on_frame(&mut self, frame: &Frame, peer: SocketAddr) -> Result<Dispatch, StageError> {
        let config = &self.shared.config;
        let discovery = self
            .shared
            .registry
            .transaction(|t| handlers::on_greeting(t, frame, config))?;

        // From here on the guard owns cleanup of the port and secret.
        let guard = ListenerGuard::new(
            self.shared.registry.clone(),
            discovery.port,
            ListenerKind::Transfer,
            Some(discovery.secret),
        )
        .tracked(self.shutdown.clone());
        let socket = Socket::from_std(discovery.socket).map_err(StageError::Listener)?;

        log::info!(
            "[a] client {} at {peer} -> transfer port {}",
            frame.client_id(),
            discovery.port
        );
        let handler = TransferHandler {
            shared: self.shared.clone(),
            secret: discovery.secret,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(run_datagram_listener(
            socket,
            handler,
            Some(config.idle_timeout),
            guard,
            self.shutdown.clone(),
        ));
        Ok(Dispatch::reply(discovery.reply))
    }
}

// ---------------------------------------------------------------------------
// Stage B
// ---------------------------------------------------------------------------

struct TransferHandler {
    shared: Shared,
    /// The stage-A secret this listener serves.
    secret: u32,
    shutdown: ShutdownSignal,
}

impl DatagramHandler for TransferHandler {
    fn tag(&self) -> &'static str {
        "b"
    }

    fn on_frame(&mut self, frame: &Frame, peer: SocketAddr) -> Result<Dispatch, StageError> {
        let bind_ip = self.shared.config.bind_ip;
        let outcome = self
            .shared
            .registry
            .transaction(|t| handlers::on_transfer_packet(t, self.secret, frame, bind_ip))?;

        match outcome {
            TransferOutcome::Withheld => {
                log::debug!("[b] withholding ack to {peer} once");
                Ok(Dispatch::silent())
            }
            TransferOutcome::Ack(ack) => Ok(Dispatch::reply(ack)),
            TransferOutcome::Complete {
                ack,
                handoff,
                secret,
                listener,
                port,
            } => {
                let guard = ListenerGuard::new(
                    self.shared.registry.clone(),
                    port,
                    ListenerKind::Bulk,
                    Some(secret),
                )
                .tracked(self.shutdown.clone());
                listener.set_nonblocking(true).map_err(StageError::Listener)?;
                let listener = TcpListener::from_std(listener).map_err(StageError::Listener)?;

                log::info!("[b] client {} transfer complete -> tcp port {port}", frame.client_id());
                tokio::spawn(run_bulk_listener(
                    listener,
                    guard,
                    self.shared.clone(),
                    self.shutdown.clone(),
                ));
                Ok(Dispatch {
                    replies: vec![ack, handoff],
                    finished: true,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stages C and D
// ---------------------------------------------------------------------------

async fn run_bulk_listener(
    listener: TcpListener,
    mut guard: ListenerGuard,
    shared: Shared,
    mut shutdown: ShutdownSignal,
) {
    let result = tokio::select! {
        _ = shutdown.wait() => None,
        result = bulk_session(&listener, &mut guard, &shared) => Some(result),
    };
    let reason = match result {
        None => CloseReason::Shutdown,
        Some(Ok(())) => CloseReason::Completed,
        Some(Err(StageError::IdleTimeout(_))) => CloseReason::IdleTimeout,
        Some(Err(e)) => {
            log::debug!("[cd] port {} aborted: {e}", guard.port());
            CloseReason::Aborted
        }
    };
    log::debug!("[cd] port {} closed: {reason:?}", guard.port());
    drop(guard);
}

/// Accept one connection, run stage C, then validate stage D on it.
///
/// The guard's secret tracks the session: B until the connection is
/// accepted, C until the terminal secret is sent.
async fn bulk_session(
    listener: &TcpListener,
    guard: &mut ListenerGuard,
    shared: &Shared,
) -> Result<(), StageError> {
    let idle = shared.config.idle_timeout;
    let handoff_secret = guard
        .secret()
        .ok_or_else(|| StageError::ProtocolViolation("bulk listener has no session".into()))?;

    let (tcp, peer) = timeout(idle, listener.accept())
        .await
        .map_err(|_| StageError::IdleTimeout(idle))?
        .map_err(SocketError::from)?;
    let mut stream = FrameStream::new(tcp).map_err(SocketError::from)?;

    let opened = shared
        .registry
        .transaction(|t| handlers::on_handoff(t, handoff_secret))?;
    guard.adopt(opened.secret);
    log::info!(
        "[cd] client {} connected from {peer}: {} x {} bytes of {:#04x}",
        opened.state.client_id,
        opened.state.repeat_count,
        opened.state.chunk_len,
        opened.state.expected_byte
    );
    stream.write_frame(&opened.reply).await?;

    let max_payload = padded_len(opened.state.chunk_len as usize);
    for i in 0..opened.state.repeat_count {
        let frame = timeout(idle, stream.read_frame(max_payload))
            .await
            .map_err(|_| StageError::IdleTimeout(idle))??;
        shared
            .registry
            .transaction(|t| handlers::on_bulk_frame(t, opened.secret, &frame))?;
        log::debug!("[cd] frame {}/{} ok", i + 1, opened.state.repeat_count);
    }

    let done = shared
        .registry
        .transaction(|t| handlers::finish_bulk(t, opened.secret))?;
    stream.write_frame(&done).await?;
    let _ = stream.shutdown().await;
    log::info!("[cd] client {} session complete", opened.state.client_id);
    Ok(())
}
