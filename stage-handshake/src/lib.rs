//! `stage-handshake`: a four-stage UDP-to-TCP handshake protocol.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  greeting / packets (udp)  ┌────────────────────────┐
//!  │  Client  │───────────────────────────▶│ listener tasks (a, b)  │
//!  │          │◀───────────────────────────│                        │
//!  │          │  params / bulk (tcp)       │ listener task (cd)     │
//!  │          │◀──────────────────────────▶│                        │
//!  └──────────┘                            └───────────┬────────────┘
//!                                                      │ transaction
//!                                          ┌───────────▼────────────┐
//!                                          │    SessionRegistry     │
//!                                          │ secrets, records, ports│
//!                                          └────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     wire format (serialise / deserialise frames)
//! - [`messages`]   per-stage payload schemas
//! - [`state`]      the stage vocabulary
//! - [`transfer`]   stage-B counting and drop-once state machine
//! - [`registry`]   secrets, session records and the listener table
//! - [`handlers`]   per-stage server transitions, run under the registry lock
//! - [`listener`]   listener guards, shutdown signal and the datagram loop
//! - [`server`]     spawns and supervises listener tasks
//! - [`client`]     drives one session through all four stages
//! - [`config`]     server and client parameters
//! - [`socket`]     async UDP / TCP frame I/O

pub mod client;
pub mod config;
pub mod handlers;
pub mod listener;
pub mod messages;
pub mod packet;
pub mod registry;
pub mod server;
pub mod socket;
pub mod state;
pub mod transfer;

pub use client::{ClientError, ProtocolClient, SessionSecrets};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use packet::{Frame, FrameError};
pub use registry::{ListenerKind, SessionRegistry};
pub use server::{ProtocolServer, ServerError};
pub use state::Stage;
