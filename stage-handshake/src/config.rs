//! Tunable parameters for the server and the client.
//!
//! Defaults reproduce the classic deployment: the discovery listener on
//! UDP 12235, a 3-second idle lifetime for per-session listeners, and a
//! half-second client retransmit timeout.  `main.rs` overrides them from
//! CLI flags; tests shrink the timeouts.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::registry::DEFAULT_PORT_RANGE;

/// Well-known stage-A port.
pub const DISCOVERY_PORT: u16 = 12235;

/// Idle lifetime of each per-session listener.
pub const LISTENER_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the client waits for an ack before resending.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Transmissions of one frame before the client gives up.
pub const MAX_ATTEMPTS: u32 = 10;

/// Probability that a stage-B packet id joins the drop-once set.
pub const DEFAULT_DROP_RATE: f64 = 0.2;

/// Server-side parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address every listener binds to.
    pub bind_ip: IpAddr,
    /// Stage-A port; `0` lets the OS choose (useful in tests).
    pub discovery_port: u16,
    /// Listeners close after this long without an accepted frame.
    pub idle_timeout: Duration,
    /// Range per-session ports are drawn from.
    pub port_range: RangeInclusive<u16>,
    /// See [`DEFAULT_DROP_RATE`].
    pub drop_rate: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: DISCOVERY_PORT,
            idle_timeout: LISTENER_IDLE_TIMEOUT,
            port_range: DEFAULT_PORT_RANGE,
            drop_rate: DEFAULT_DROP_RATE,
        }
    }
}

/// A [`ServerConfig`] the server refuses to start with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("drop rate {0} is not a probability in [0, 1]")]
    DropRate(f64),
    #[error("port range {start}..={end} is empty")]
    EmptyPortRange { start: u16, end: u16 },
}

impl ServerConfig {
    /// Reject values that would only fail later, inside a listener task.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(ConfigError::DropRate(self.drop_rate));
        }
        if self.port_range.is_empty() {
            return Err(ConfigError::EmptyPortRange {
                start: *self.port_range.start(),
                end: *self.port_range.end(),
            });
        }
        Ok(())
    }

    /// Loopback server on an OS-chosen discovery port.
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: 0,
            ..Self::default()
        }
    }
}

/// Client-side parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wait for a UDP response before resending.
    pub ack_timeout: Duration,
    /// Transmissions of one UDP frame before `AckFailed`.
    pub max_attempts: u32,
    /// Bound on each TCP connect and read.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: ACK_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
            response_timeout: LISTENER_IDLE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ServerConfig::default().validate(), Ok(()));
        assert_eq!(ServerConfig::loopback().validate(), Ok(()));
    }

    #[test]
    fn drop_rate_must_be_a_probability() {
        for bad in [f64::NAN, -0.1, 1.5, f64::INFINITY] {
            let config = ServerConfig {
                drop_rate: bad,
                ..ServerConfig::loopback()
            };
            assert!(matches!(config.validate(), Err(ConfigError::DropRate(_))), "{bad}");
        }
        for good in [0.0, 0.5, 1.0] {
            let config = ServerConfig {
                drop_rate: good,
                ..ServerConfig::loopback()
            };
            assert_eq!(config.validate(), Ok(()));
        }
    }

    #[test]
    fn empty_port_range_is_rejected() {
        #[allow(clippy::reversed_empty_ranges)]
        let config = ServerConfig {
            port_range: 5000..=4000,
            ..ServerConfig::loopback()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyPortRange {
                start: 5000,
                end: 4000
            })
        );
    }
}
