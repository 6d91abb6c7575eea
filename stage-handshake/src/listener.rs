//! Listener plumbing shared by every stage.
//!
//! - [`bind_fresh`] picks an unused port from the registry and binds it,
//!   inside the caller's transaction.
//! - [`ListenerGuard`] is the cleanup half of a listener: dropping it
//!   removes the port from the listener table and expires the secret the
//!   listener was serving.
//! - [`ShutdownSignal`] lets the server stop every listener task and wait
//!   for all of them to finish.
//! - [`serve_datagrams`] is the receive loop for the UDP stages.  It
//!   dispatches each frame to a [`DatagramHandler`] and enforces the idle
//!   deadline.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::handlers::StageError;
use crate::packet::Frame;
use crate::registry::{ListenerKind, SessionRegistry, SessionTable};
use crate::socket::{Socket, SocketError};

/// Ports tried before giving up when the OS reports them in use.
const BIND_ATTEMPTS: usize = 32;

/// Bind a fresh port from the registry's range and register it as `kind`.
///
/// `bind` is tried on up to [`BIND_ATTEMPTS`] random ports; a port held by
/// some other process (`AddrInUse`) is skipped.  Must run inside a
/// transaction so no other session can claim the same port meanwhile.
pub(crate) fn bind_fresh<T>(
    table: &mut SessionTable,
    kind: ListenerKind,
    mut bind: impl FnMut(u16) -> io::Result<T>,
) -> Result<(T, u16), StageError> {
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = table.new_port()?;
        match bind(port) {
            Ok(sock) => {
                table.register_listener(port, kind);
                return Ok((sock, port));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                log::debug!("[{kind}] port {port} busy; drawing another");
                last_err = Some(e);
            }
            Err(e) => return Err(StageError::Listener(e)),
        }
    }
    Err(StageError::Listener(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "no bindable port found")
    })))
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Cloneable shutdown handle held by every listener task.
///
/// Holding a clone also keeps the server's completion channel open, so the
/// server knows all tasks have finished once every clone is dropped.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal {
    requested: watch::Receiver<bool>,
    _alive: mpsc::Sender<()>,
}

impl ShutdownSignal {
    pub(crate) fn new(requested: watch::Receiver<bool>, alive: mpsc::Sender<()>) -> Self {
        Self {
            requested,
            _alive: alive,
        }
    }

    /// Resolve once shutdown is requested or the server handle is dropped.
    pub(crate) async fn wait(&mut self) {
        let _ = self.requested.wait_for(|stop| *stop).await;
    }
}

// ---------------------------------------------------------------------------
// ListenerGuard
// ---------------------------------------------------------------------------

/// Releases one listener's registry resources when dropped.
///
/// Create it only *after* the transaction that bound the port has returned:
/// its `Drop` takes the registry lock.
#[derive(Debug)]
pub(crate) struct ListenerGuard {
    registry: SessionRegistry,
    port: u16,
    kind: ListenerKind,
    secret: Option<u32>,
    _shutdown: Option<ShutdownSignal>,
}

impl ListenerGuard {
    pub(crate) fn new(
        registry: SessionRegistry,
        port: u16,
        kind: ListenerKind,
        secret: Option<u32>,
    ) -> Self {
        Self {
            registry,
            port,
            kind,
            secret,
            _shutdown: None,
        }
    }

    pub(crate) fn tracked(mut self, shutdown: ShutdownSignal) -> Self {
        self._shutdown = Some(shutdown);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Secret this listener currently serves.
    pub fn secret(&self) -> Option<u32> {
        self.secret
    }

    /// Serve `secret` from now on (stage C hands over to stage D).
    pub fn adopt(&mut self, secret: u32) {
        self.secret = Some(secret);
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let expired = self.secret.map(|s| self.registry.expire(s)).unwrap_or(false);
        self.registry.release_listener(self.port);
        log::debug!(
            "[{}] listener on port {} released{}",
            self.kind,
            self.port,
            if expired { " (session abandoned)" } else { "" }
        );
    }
}

// ---------------------------------------------------------------------------
// Datagram loop
// ---------------------------------------------------------------------------

/// Replies produced by one handled frame.
#[derive(Debug, Default)]
pub(crate) struct Dispatch {
    pub replies: Vec<Frame>,
    /// Close the listener after sending `replies`.
    pub finished: bool,
}

impl Dispatch {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn reply(frame: Frame) -> Self {
        Self {
            replies: vec![frame],
            finished: false,
        }
    }
}

/// One UDP stage's frame handler.
pub(crate) trait DatagramHandler: Send {
    /// Tag used in log lines, e.g. `"a"`.
    fn tag(&self) -> &'static str;

    /// Handle one decoded frame.  `Err` drops the frame without a reply.
    fn on_frame(&mut self, frame: &Frame, peer: SocketAddr) -> Result<Dispatch, StageError>;
}

/// Why a listener loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The stage finished for its session.
    Completed,
    /// No accepted frame within the idle timeout.
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
    /// The session failed validation or its transport broke.
    Aborted,
}

/// Receive, dispatch and reply until completion, idle timeout or shutdown.
///
/// `idle == None` disables the deadline (the discovery listener).  The
/// deadline is pushed back only by frames the handler accepts, so garbage
/// traffic cannot keep a session listener alive.
pub(crate) async fn serve_datagrams<H: DatagramHandler>(
    socket: &Socket,
    handler: &mut H,
    idle: Option<Duration>,
    shutdown: &mut ShutdownSignal,
) -> CloseReason {
    let tag = handler.tag();
    // A disarmed deadline sits far in the future; the `if` guard below
    // keeps it from ever being polled.
    let far_future = Duration::from_secs(365 * 24 * 3600);
    let timer = tokio::time::sleep(idle.unwrap_or(far_future));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = shutdown.wait() => return CloseReason::Shutdown,

            _ = &mut timer, if idle.is_some() => return CloseReason::IdleTimeout,

            result = socket.recv_from() => {
                let (frame, peer) = match result {
                    Ok(v) => v,
                    Err(SocketError::Frame(e)) => {
                        log::debug!("[{tag}] dropped datagram: {e}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("[{tag}] receive failed on {}: {e}", socket.local_addr);
                        continue;
                    }
                };

                match handler.on_frame(&frame, peer) {
                    Ok(dispatch) => {
                        if let Some(idle) = idle {
                            timer.as_mut().reset(Instant::now() + idle);
                        }
                        for reply in &dispatch.replies {
                            if let Err(e) = socket.send_to(reply, peer).await {
                                log::warn!("[{tag}] reply to {peer} failed: {e}");
                            }
                        }
                        if dispatch.finished {
                            return CloseReason::Completed;
                        }
                    }
                    Err(e) => log::debug!("[{tag}] dropped frame from {peer}: {e}"),
                }
            }
        }
    }
}
