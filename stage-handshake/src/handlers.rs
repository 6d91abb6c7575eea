//! Per-stage server transitions.
//!
//! Every function here takes `&mut SessionTable` and is meant to run as the
//! body of one [`SessionRegistry::transaction`](crate::registry::SessionRegistry::transaction):
//! validation, record updates, secret minting and listener binding for a
//! transition all happen in one critical section.  No function awaits or
//! touches a tokio socket; the listener tasks in [`crate::server`] do the
//! sending once the lock is released.
//!
//! Failures are [`StageError`]s.  The listener loops log them and drop the
//! offending frame; nothing here ever produces a reply for a bad frame.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::config::ServerConfig;
use crate::listener::bind_fresh;
use crate::messages::{
    BulkParams, CompletionReply, DiscoveryReply, HandoffReply, MessageError, TransferAck,
    TransferPacket, GREETING,
};
use crate::packet::{step, Frame, FrameError};
use crate::registry::{
    BulkState, HandoffState, ListenerKind, RegistryError, SessionRecord, SessionTable,
};
use crate::socket::SocketError;
use crate::transfer::{PacketVerdict, TransferState};

/// Why a server-side stage refused to act on a frame or connection.
#[derive(Debug, Error)]
pub enum StageError {
    /// The bytes were not a frame at all.
    #[error(transparent)]
    Malformed(#[from] FrameError),
    /// A well-formed frame that fails the stage's preconditions.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The frame names a secret that is not active.
    #[error("unknown secret {0:#010x}")]
    UnknownSecret(u32),
    /// The next stage's listener could not be bound.
    #[error("cannot open listener: {0}")]
    Listener(#[source] io::Error),
    /// Every port in the configured range is taken.
    #[error("no free port in {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },
    /// Stream I/O failed mid-session.
    #[error("transport: {0}")]
    Transport(#[from] SocketError),
    /// The peer went quiet for longer than the listener's idle timeout.
    #[error("idle for {0:?}")]
    IdleTimeout(Duration),
}

impl From<RegistryError> for StageError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownSecret(s) => StageError::UnknownSecret(s),
            RegistryError::PortsExhausted { start, end } => StageError::PortsExhausted { start, end },
        }
    }
}

impl From<MessageError> for StageError {
    fn from(e: MessageError) -> Self {
        StageError::ProtocolViolation(e.to_string())
    }
}

fn violation(msg: impl Into<String>) -> StageError {
    StageError::ProtocolViolation(msg.into())
}

fn expect_request(frame: &Frame) -> Result<(), StageError> {
    if frame.stage() != step::REQUEST {
        return Err(violation(format!("stage field {} is not a request", frame.stage())));
    }
    Ok(())
}

fn expect_client(record: &SessionRecord, frame: &Frame) -> Result<(), StageError> {
    if record.client_id() != frame.client_id() {
        return Err(violation(format!(
            "client id {} does not own this session (expected {})",
            frame.client_id(),
            record.client_id()
        )));
    }
    Ok(())
}

fn response(payload: &[u8], request: &Frame) -> Frame {
    Frame::new(payload, request.prev_secret(), step::RESPONSE, request.client_id())
}

// ---------------------------------------------------------------------------
// Stage A
// ---------------------------------------------------------------------------

/// A greeting that opened a new session.
#[derive(Debug)]
pub struct Discovery {
    /// Response for the greeting's sender.
    pub reply: Frame,
    /// Secret the stage-B listener serves.
    pub secret: u32,
    /// Freshly bound stage-B socket, already in the listener table.
    pub socket: std::net::UdpSocket,
    pub port: u16,
}

/// Validate a greeting and open a stage-B listener for it.
pub fn on_greeting(
    table: &mut SessionTable,
    frame: &Frame,
    config: &ServerConfig,
) -> Result<Discovery, StageError> {
    expect_request(frame)?;
    if frame.prev_secret() != 0 {
        return Err(violation("greeting must carry a zero secret"));
    }
    if frame.payload() != GREETING {
        return Err(violation("greeting payload mismatch"));
    }

    let state = TransferState::random(frame.client_id(), config.drop_rate, &mut rand::rng());
    let (socket, port) = bind_fresh(table, ListenerKind::Transfer, |port| {
        std::net::UdpSocket::bind(SocketAddr::new(config.bind_ip, port))
    })?;
    let secret = table.new_secret();

    let reply = response(
        &DiscoveryReply {
            packet_count: state.packet_count,
            chunk_len: state.chunk_len,
            udp_port: port,
            secret,
        }
        .to_payload(),
        frame,
    );
    table.put(secret, SessionRecord::Transfer(state));

    Ok(Discovery {
        reply,
        secret,
        socket,
        port,
    })
}

// ---------------------------------------------------------------------------
// Stage B
// ---------------------------------------------------------------------------

/// What a stage-B listener should do after one packet.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Drop-once: send nothing.
    Withheld,
    /// Send this ack and keep listening.
    Ack(Frame),
    /// All packets counted: send both frames, then close the listener.
    Complete {
        ack: Frame,
        handoff: Frame,
        /// Secret the stage-C listener serves.
        secret: u32,
        /// Freshly bound stage-C listener, already in the listener table.
        listener: std::net::TcpListener,
        port: u16,
    },
}

/// Apply one stage-B packet to the session keyed by `listener_secret`.
pub fn on_transfer_packet(
    table: &mut SessionTable,
    listener_secret: u32,
    frame: &Frame,
    bind_ip: IpAddr,
) -> Result<TransferOutcome, StageError> {
    expect_request(frame)?;
    if frame.prev_secret() != listener_secret {
        return Err(violation(format!(
            "secret {:#010x} is not served on this port",
            frame.prev_secret()
        )));
    }

    let record = table.get_mut(listener_secret)?;
    expect_client(record, frame)?;
    let SessionRecord::Transfer(state) = record else {
        return Err(violation(format!(
            "secret was issued by stage {}, not a",
            record.issued_by()
        )));
    };

    let packet = TransferPacket::parse(frame.payload(), state.chunk_len)?;
    let verdict = state.on_packet(packet.packet_id);
    let complete = state.is_complete();
    let client_id = state.client_id;

    let ack = match verdict {
        PacketVerdict::OutOfRange => {
            return Err(violation(format!(
                "packet id {} out of range",
                packet.packet_id
            )))
        }
        PacketVerdict::Withheld => return Ok(TransferOutcome::Withheld),
        PacketVerdict::Accepted | PacketVerdict::Duplicate => response(
            &TransferAck {
                packet_id: packet.packet_id,
            }
            .to_payload(),
            frame,
        ),
    };
    if !complete {
        return Ok(TransferOutcome::Ack(ack));
    }

    // Bind before retiring the stage-A secret: if binding fails the ack is
    // not sent, the client resends, and completion is retried.
    let (listener, port) = bind_fresh(table, ListenerKind::Bulk, |port| {
        std::net::TcpListener::bind(SocketAddr::new(bind_ip, port))
    })?;
    table.expire(listener_secret);
    let secret = table.new_secret();
    table.put(
        secret,
        SessionRecord::Handoff(HandoffState {
            client_id,
            tcp_port: port,
        }),
    );
    let handoff = response(
        &HandoffReply {
            tcp_port: port,
            secret,
        }
        .to_payload(),
        frame,
    );

    Ok(TransferOutcome::Complete {
        ack,
        handoff,
        secret,
        listener,
        port,
    })
}

// ---------------------------------------------------------------------------
// Stages C and D
// ---------------------------------------------------------------------------

/// Parameters chosen when the stage-C connection is accepted.
#[derive(Debug)]
pub struct BulkOpened {
    pub reply: Frame,
    pub secret: u32,
    pub state: BulkState,
}

/// Swap the stage-B record for a fresh stage-C record.
pub fn on_handoff(table: &mut SessionTable, handoff_secret: u32) -> Result<BulkOpened, StageError> {
    let record = table.get(handoff_secret)?;
    let SessionRecord::Handoff(handoff) = record else {
        return Err(violation(format!(
            "secret was issued by stage {}, not b",
            record.issued_by()
        )));
    };

    let state = BulkState::random(handoff.client_id, &mut rand::rng());
    let secret = table.new_secret();
    table.put(secret, SessionRecord::Bulk(state));
    table.expire(handoff_secret);

    let reply = Frame::new(
        &BulkParams {
            repeat_count: state.repeat_count,
            chunk_len: state.chunk_len,
            secret,
            expected_byte: state.expected_byte,
        }
        .to_payload(),
        handoff_secret,
        step::RESPONSE,
        state.client_id,
    );
    Ok(BulkOpened {
        reply,
        secret,
        state,
    })
}

/// Check one stage-D frame against the session keyed by `bulk_secret`.
pub fn on_bulk_frame(
    table: &SessionTable,
    bulk_secret: u32,
    frame: &Frame,
) -> Result<(), StageError> {
    expect_request(frame)?;
    if frame.prev_secret() != bulk_secret {
        return Err(StageError::UnknownSecret(frame.prev_secret()));
    }
    let record = table.get(bulk_secret)?;
    expect_client(record, frame)?;
    let SessionRecord::Bulk(state) = record else {
        return Err(violation(format!(
            "secret was issued by stage {}, not c",
            record.issued_by()
        )));
    };
    if !state.accepts(frame.payload()) {
        return Err(violation("bulk payload does not repeat the expected byte"));
    }
    Ok(())
}

/// Retire the stage-C secret and mint the terminal secret.
pub fn finish_bulk(table: &mut SessionTable, bulk_secret: u32) -> Result<Frame, StageError> {
    let client_id = table.get(bulk_secret)?.client_id();
    table.expire(bulk_secret);
    let secret = table.mint_terminal();
    Ok(Frame::new(
        &CompletionReply { secret }.to_payload(),
        bulk_secret,
        step::RESPONSE,
        client_id,
    ))
}
