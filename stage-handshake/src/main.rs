//! Entry point for `stage-handshake`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stage_handshake::config::{DEFAULT_DROP_RATE, DISCOVERY_PORT, LISTENER_IDLE_TIMEOUT};
use stage_handshake::{ProtocolClient, ProtocolServer, ServerConfig};

/// Four-stage UDP-to-TCP handshake protocol.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the server until Ctrl-C.
    Server {
        /// Local address every listener binds to.
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Discovery (stage A) port.
        #[arg(short, long, default_value_t = DISCOVERY_PORT)]
        port: u16,
        /// Idle lifetime of per-session listeners, in milliseconds.
        #[arg(long, default_value_t = LISTENER_IDLE_TIMEOUT.as_millis() as u64)]
        idle_timeout_ms: u64,
        /// Probability that a stage-B packet is left unacknowledged once.
        #[arg(long, default_value_t = DEFAULT_DROP_RATE, value_parser = parse_probability)]
        drop_rate: f64,
    },
    /// Run one or more client sessions against a server.
    Client {
        /// Discovery address of the server (e.g. 127.0.0.1:12235).
        #[arg(short, long)]
        server: SocketAddr,
        /// Client id of the first session; later sessions count up from it.
        #[arg(short, long, default_value_t = 1)]
        client_id: u16,
        /// Number of concurrent sessions.
        #[arg(long, default_value_t = 1)]
        sessions: u16,
    },
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let p: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{s} is not a probability in [0, 1]"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            port,
            idle_timeout_ms,
            drop_rate,
        } => {
            let config = ServerConfig {
                bind_ip: bind,
                discovery_port: port,
                idle_timeout: Duration::from_millis(idle_timeout_ms),
                drop_rate,
                ..ServerConfig::default()
            };
            let server = ProtocolServer::start(config)
                .await
                .with_context(|| format!("starting server on {bind}:{port}"))?;
            log::info!("Server ready on {}", server.local_addr());
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            server.shutdown().await;
        }
        Mode::Client {
            server,
            client_id,
            sessions,
        } => {
            log::info!("Starting {sessions} session(s) against {server}");
            let handles: Vec<_> = (0..sessions)
                .map(|i| {
                    let client = ProtocolClient::new(server, client_id.wrapping_add(i));
                    tokio::spawn(async move { (client.client_id(), client.run().await) })
                })
                .collect();

            let mut failed = 0usize;
            for handle in handles {
                let (id, result) = handle.await.context("client task panicked")?;
                match result {
                    Ok(secrets) => {
                        let line: Vec<String> = secrets
                            .labelled()
                            .iter()
                            .map(|(label, secret)| format!("{label}={secret}"))
                            .collect();
                        println!("client {id}: {}", line.join(" "));
                    }
                    Err(e) => {
                        eprintln!("client {id}: {e}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {sessions} session(s) failed");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_rate_outside_unit_interval_is_a_usage_error() {
        for bad in ["NaN", "-0.1", "1.5", "inf"] {
            let parsed = Cli::try_parse_from(["stage-handshake", "server", "--drop-rate", bad]);
            assert!(parsed.is_err(), "{bad}");
        }
        let parsed = Cli::try_parse_from(["stage-handshake", "server", "--drop-rate", "0.5"]);
        assert!(parsed.is_ok());
    }
}
