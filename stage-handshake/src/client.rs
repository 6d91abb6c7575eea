//! The protocol client: drives one session through stages A to D.
//!
//! [`ProtocolClient::run`] performs the whole handshake.  The individual
//! stages are public as well, so a caller can stop between them (the
//! timeout tests pause after stage A to let the server's listener expire).
//!
//! UDP stages use a stop-and-wait loop: send, wait up to
//! [`ClientConfig::ack_timeout`] for a matching response, resend, and give
//! up with [`ClientError::AckFailed`] after [`ClientConfig::max_attempts`]
//! transmissions.  Any I/O error (a closed port included) ends the session
//! at once as [`ClientError::Transport`].

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::ClientConfig;
use crate::messages::{
    BulkParams, CompletionReply, DiscoveryReply, HandoffReply, MessageError, TransferAck,
    TransferPacket, GREETING,
};
use crate::packet::{padded_len, step, Frame, FrameError};
use crate::socket::{FrameStream, Socket, SocketError};
use crate::state::Stage;

/// Errors that end a client session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket failure, including a port the server has already closed.
    /// Never retried.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),
    /// No matching response after the configured number of transmissions.
    #[error("stage {stage}: no response after {attempts} attempts (packet {packet_id:?})")]
    AckFailed {
        stage: Stage,
        packet_id: Option<u32>,
        attempts: u32,
    },
    /// A TCP connect or read did not finish in time.
    #[error("stage {stage}: timed out")]
    Timeout { stage: Stage },
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
    /// A well-formed frame that does not fit the stage.
    #[error("stage {stage}: unexpected response: {reason}")]
    UnexpectedResponse { stage: Stage, reason: String },
}

impl ClientError {
    fn from_socket(stage: Stage, e: SocketError) -> Self {
        match e {
            SocketError::Io(e) => ClientError::Transport(e),
            SocketError::Frame(e) => ClientError::Malformed(e),
            other => ClientError::UnexpectedResponse {
                stage,
                reason: other.to_string(),
            },
        }
    }

    fn unexpected(stage: Stage, e: MessageError) -> Self {
        ClientError::UnexpectedResponse {
            stage,
            reason: e.to_string(),
        }
    }
}

/// The four secrets a completed session collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSecrets {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}

impl SessionSecrets {
    /// Secrets keyed by stage label (`'a'` to `'d'`).
    pub fn labelled(&self) -> BTreeMap<char, u32> {
        Stage::ALL
            .iter()
            .zip([self.a, self.b, self.c, self.d])
            .map(|(stage, secret)| (stage.label(), secret))
            .collect()
    }
}

/// An open stage-C connection, ready for stage D.
#[derive(Debug)]
pub struct BulkSession {
    stream: FrameStream,
    params: BulkParams,
}

impl BulkSession {
    pub fn params(&self) -> &BulkParams {
        &self.params
    }
}

/// Drives sessions against one server.
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    server: SocketAddr,
    client_id: u16,
    config: ClientConfig,
}

impl ProtocolClient {
    /// `server` is the address of the discovery (stage-A) listener.
    pub fn new(server: SocketAddr, client_id: u16) -> Self {
        Self::with_config(server, client_id, ClientConfig::default())
    }

    pub fn with_config(server: SocketAddr, client_id: u16, config: ClientConfig) -> Self {
        Self {
            server,
            client_id,
            config,
        }
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Run all four stages.
    pub async fn run(&self) -> Result<SessionSecrets, ClientError> {
        let discovery = self.stage_a().await?;
        let handoff = self.stage_b(&discovery).await?;
        let bulk = self.stage_c(&handoff).await?;
        let c = bulk.params.secret;
        let d = self.stage_d(bulk).await?;
        let secrets = SessionSecrets {
            a: discovery.secret,
            b: handoff.secret,
            c,
            d,
        };
        log::info!("client {}: session complete {:?}", self.client_id, secrets.labelled());
        Ok(secrets)
    }

    /// Greet the discovery listener.
    pub async fn stage_a(&self) -> Result<DiscoveryReply, ClientError> {
        let socket = self.udp_socket(self.server, Stage::A).await?;
        let greeting = self.frame(GREETING, 0);
        let reply = self
            .request(&socket, &greeting, Stage::A, None, |frame| {
                self.expect_response(frame, 0)
                    .then(|| DiscoveryReply::parse(frame.payload()))
                    .transpose()
                    .map_err(|e| ClientError::unexpected(Stage::A, e))
            })
            .await?;
        log::debug!(
            "[a] client {}: {} packets of {} bytes to port {}",
            self.client_id,
            reply.packet_count,
            reply.chunk_len,
            reply.udp_port
        );
        Ok(reply)
    }

    /// Deliver every transfer packet, then wait for the TCP handoff.
    pub async fn stage_b(&self, discovery: &DiscoveryReply) -> Result<HandoffReply, ClientError> {
        let peer = SocketAddr::new(self.server.ip(), discovery.udp_port);
        let socket = self.udp_socket(peer, Stage::B).await?;
        let secret = discovery.secret;

        for packet_id in 0..discovery.packet_count {
            let payload = TransferPacket {
                packet_id,
                chunk_len: discovery.chunk_len,
            }
            .to_payload();
            let packet = self.frame(&payload, secret);
            self.request(&socket, &packet, Stage::B, Some(packet_id), |frame| {
                if !self.expect_response(frame, secret) {
                    return Ok(None);
                }
                // Handoff replies are 8 bytes; only 4-byte acks count here.
                match TransferAck::parse(frame.payload()) {
                    Ok(ack) => Ok((ack.packet_id == packet_id).then_some(())),
                    Err(_) => Ok(None),
                }
            })
            .await?;
            log::debug!("[b] client {}: packet {packet_id} acked", self.client_id);
        }

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let frame = match timeout_at(deadline, socket.recv()).await {
                Err(_) => return Err(ClientError::Timeout { stage: Stage::B }),
                Ok(Err(SocketError::Frame(e))) => {
                    log::debug!("[b] ignoring malformed datagram: {e}");
                    continue;
                }
                Ok(result) => result.map_err(|e| ClientError::from_socket(Stage::B, e))?,
            };
            if !self.expect_response(&frame, secret) {
                continue;
            }
            match HandoffReply::parse(frame.payload()) {
                Ok(handoff) => return Ok(handoff),
                // Stray duplicate ack.
                Err(MessageError::WrongLength { got: 4, .. }) => continue,
                Err(e) => return Err(ClientError::unexpected(Stage::B, e)),
            }
        }
    }

    /// Connect to the handed-off TCP port and read the stage-D parameters.
    pub async fn stage_c(&self, handoff: &HandoffReply) -> Result<BulkSession, ClientError> {
        let peer = SocketAddr::new(self.server.ip(), handoff.tcp_port);
        let mut stream = timeout(self.config.response_timeout, FrameStream::connect(peer))
            .await
            .map_err(|_| ClientError::Timeout { stage: Stage::C })?
            .map_err(|e| ClientError::from_socket(Stage::C, e))?;

        let frame = self.read_stream(&mut stream, Stage::C, BULK_PARAMS_LEN).await?;
        if !self.expect_response(&frame, handoff.secret) {
            return Err(ClientError::UnexpectedResponse {
                stage: Stage::C,
                reason: format!("response keyed by {:#010x}", frame.prev_secret()),
            });
        }
        let params =
            BulkParams::parse(frame.payload()).map_err(|e| ClientError::unexpected(Stage::C, e))?;
        log::debug!(
            "[c] client {}: {} frames of {} x {:#04x}",
            self.client_id,
            params.repeat_count,
            params.chunk_len,
            params.expected_byte
        );
        Ok(BulkSession { stream, params })
    }

    /// Send the repeated frames and collect the terminal secret.
    pub async fn stage_d(&self, session: BulkSession) -> Result<u32, ClientError> {
        let BulkSession { mut stream, params } = session;
        let frame = self.frame(&params.bulk_payload(), params.secret);
        for _ in 0..params.repeat_count {
            stream
                .write_frame(&frame)
                .await
                .map_err(|e| ClientError::from_socket(Stage::D, e))?;
        }

        let reply = self.read_stream(&mut stream, Stage::D, COMPLETION_LEN).await?;
        if !self.expect_response(&reply, params.secret) {
            return Err(ClientError::UnexpectedResponse {
                stage: Stage::D,
                reason: format!("response keyed by {:#010x}", reply.prev_secret()),
            });
        }
        let done =
            CompletionReply::parse(reply.payload()).map_err(|e| ClientError::unexpected(Stage::D, e))?;
        Ok(done.secret)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn frame(&self, payload: &[u8], prev_secret: u32) -> Frame {
        Frame::new(payload, prev_secret, step::REQUEST, self.client_id)
    }

    /// `true` if `frame` is a server response to our request keyed by `secret`.
    fn expect_response(&self, frame: &Frame, secret: u32) -> bool {
        frame.stage() == step::RESPONSE
            && frame.prev_secret() == secret
            && frame.client_id() == self.client_id
    }

    async fn udp_socket(&self, peer: SocketAddr, stage: Stage) -> Result<Socket, ClientError> {
        let local = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = Socket::bind(SocketAddr::new(local, 0))
            .await
            .map_err(|e| ClientError::from_socket(stage, e))?;
        socket.connect(peer).await.map_err(ClientError::Transport)?;
        Ok(socket)
    }

    /// Send `frame` until `accept` yields a value, at most `max_attempts`
    /// times.  `accept` returns `Ok(None)` for responses to ignore.
    async fn request<T>(
        &self,
        socket: &Socket,
        frame: &Frame,
        stage: Stage,
        packet_id: Option<u32>,
        mut accept: impl FnMut(&Frame) -> Result<Option<T>, ClientError>,
    ) -> Result<T, ClientError> {
        for attempt in 1..=self.config.max_attempts {
            socket
                .send(frame)
                .await
                .map_err(|e| ClientError::from_socket(stage, e))?;
            let deadline = Instant::now() + self.config.ack_timeout;
            loop {
                match timeout_at(deadline, socket.recv()).await {
                    Err(_) => {
                        log::debug!(
                            "[{stage}] client {}: attempt {attempt} timed out (packet {packet_id:?})",
                            self.client_id
                        );
                        break;
                    }
                    Ok(Err(SocketError::Frame(e))) => {
                        log::debug!("[{stage}] ignoring malformed datagram: {e}");
                    }
                    Ok(Err(e)) => return Err(ClientError::from_socket(stage, e)),
                    Ok(Ok(reply)) => {
                        if let Some(value) = accept(&reply)? {
                            return Ok(value);
                        }
                    }
                }
            }
        }
        Err(ClientError::AckFailed {
            stage,
            packet_id,
            attempts: self.config.max_attempts,
        })
    }

    async fn read_stream(
        &self,
        stream: &mut FrameStream,
        stage: Stage,
        payload_len: usize,
    ) -> Result<Frame, ClientError> {
        timeout(self.config.response_timeout, stream.read_frame(padded_len(payload_len)))
            .await
            .map_err(|_| ClientError::Timeout { stage })?
            .map_err(|e| ClientError::from_socket(stage, e))
    }
}

/// Stage-C response payload size.
const BULK_PARAMS_LEN: usize = 16;

/// Stage-D response payload size.
const COMPLETION_LEN: usize = 4;
