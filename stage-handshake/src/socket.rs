//! Async socket abstractions that speak [`Frame`]s.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket`: one datagram
//! is one frame.  [`FrameStream`] wraps `tokio::net::TcpStream`, where
//! frames are delimited by the header's declared length rounded up to the
//! 4-byte boundary.  All protocol logic lives elsewhere; this module owns
//! only byte I/O.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::packet::{Frame, FrameError, Header, HEADER_LEN};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// Largest padded payload a [`FrameStream`] will buffer for one frame.
pub const MAX_STREAM_PAYLOAD: usize = 64 * 1024;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The received bytes could not be decoded as a valid frame.
    #[error("frame decode error: {0}")]
    Frame(#[from] FrameError),
    /// A stream peer declared a payload larger than the caller allows.
    #[error("declared payload of {declared} bytes exceeds the limit of {limit}")]
    Oversized { declared: usize, limit: usize },
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, frame-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks if needed.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Adopt a socket bound synchronously (inside a registry transaction).
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let inner = UdpSocket::from_std(socket)?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Fix the default destination for [`send`](Self::send).  On a connected
    /// socket, ICMP port-unreachable reports surface as
    /// `ConnectionRefused` on a later send or receive.
    pub async fn connect(&self, peer: SocketAddr) -> io::Result<()> {
        self.inner.connect(peer).await
    }

    /// Encode `frame` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, frame: &Frame, dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(&frame.encode(), dest).await?;
        Ok(())
    }

    /// Send `frame` to the connected peer.
    pub async fn send(&self, frame: &Frame) -> Result<(), SocketError> {
        self.inner.send(&frame.encode()).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Frame`].
    ///
    /// Returns `(frame, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err`; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Frame, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let frame = Frame::decode(&buf[..n])?;
        Ok((frame, addr))
    }

    /// Receive the next datagram from the connected peer.
    pub async fn recv(&self) -> Result<Frame, SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.inner.recv(&mut buf).await?;
        Ok(Frame::decode(&buf[..n])?)
    }
}

// ---------------------------------------------------------------------------
// FrameStream
// ---------------------------------------------------------------------------

/// A TCP connection carrying back-to-back frames.
#[derive(Debug)]
pub struct FrameStream {
    inner: TcpStream,
}

impl FrameStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { inner: stream })
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, SocketError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream)?)
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), SocketError> {
        self.inner.write_all(&frame.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Read exactly one frame: the 12-byte header, then its padded payload.
    ///
    /// A header declaring more than `max_payload` padded bytes is rejected
    /// before any payload is read, leaving the stream unusable.
    pub async fn read_frame(&mut self, max_payload: usize) -> Result<Frame, SocketError> {
        let mut head = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut head).await?;
        let header = Header::decode(&head);

        let declared = header.padded_payload_len();
        if declared > max_payload {
            return Err(SocketError::Oversized {
                declared,
                limit: max_payload,
            });
        }
        let mut body = vec![0u8; declared];
        self.inner.read_exact(&mut body).await?;
        Ok(Frame::from_parts(header, body)?)
    }

    /// Half-close the write side so the peer sees EOF.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
