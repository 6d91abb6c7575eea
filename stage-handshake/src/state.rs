//! Protocol stage types.
//!
//! A session walks through four stages strictly in order.  Each stage is
//! served by its own listener, so the "current state" of a session is
//! implicit in which port a frame arrives on and which record its secret
//! resolves to.  This module only names the stages; transitions live in
//! [`crate::handlers`].
//!
//! ```text
//!  A (UDP, well-known port)  ── greeting ok ──▶  B (UDP, per-session port)
//!                                                   │ all packets acked
//!                                                   ▼
//!  done ◀── repeat frames ok ── D (same socket) ◀── C (TCP, per-session port)
//! ```

/// One phase of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Discovery: greeting over UDP on the well-known port.
    A,
    /// Windowed, acknowledged transfer over UDP.
    B,
    /// Handoff to TCP.
    C,
    /// Bulk payload validation on the stage-C connection.
    D,
}

impl Stage {
    /// All stages in protocol order.
    pub const ALL: [Stage; 4] = [Stage::A, Stage::B, Stage::C, Stage::D];

    /// Lower-case label used to key the secrets a client collects.
    pub fn label(self) -> char {
        match self {
            Stage::A => 'a',
            Stage::B => 'b',
            Stage::C => 'c',
            Stage::D => 'd',
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_chain_in_order() {
        assert!(Stage::ALL.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(Stage::ALL.first(), Some(&Stage::A));
        assert_eq!(Stage::ALL.last(), Some(&Stage::D));
    }

    #[test]
    fn labels_are_lower_case_letters() {
        let labels: String = Stage::ALL.iter().map(|s| s.label()).collect();
        assert_eq!(labels, "abcd");
        assert_eq!(Stage::C.to_string(), "c");
    }
}
