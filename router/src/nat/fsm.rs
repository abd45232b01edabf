//! Connection state machine for NAPT TCP tracking.
//!
//! The router never terminates TCP; it only observes flags crossing the
//! NAT boundary and moves each tracked connection through a deterministic
//! transition function. Unmatched (direction, flags, state) combinations
//! leave the state unchanged.

use crate::wire::tcp::TcpFlags;

/// Tracked TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
}

impl TcpState {
    /// Transitory states expire on the short NAT timeout; the
    /// established family on the long one.
    pub fn is_transitory(self) -> bool {
        matches!(
            self,
            Self::SynSent | Self::SynRcvd | Self::Closing | Self::LastAck
        )
    }
}

/// Direction of a segment relative to the NAT boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// internal → external
    Outbound,
    /// external → internal
    Inbound,
}

/// Initial state of a connection created by a SYN seen in `dir`.
pub fn initial_state(dir: Direction) -> TcpState {
    match dir {
        Direction::Outbound => TcpState::SynSent,
        Direction::Inbound => TcpState::SynRcvd,
    }
}

/// Advance `state` by one observed segment. Only the ACK/SYN/FIN bits
/// participate; RST/PSH/URG are ignored.
pub fn step(state: TcpState, dir: Direction, flags: TcpFlags) -> TcpState {
    let ack = flags.contains(TcpFlags::ACK);
    let syn = flags.contains(TcpFlags::SYN);
    let fin = flags.contains(TcpFlags::FIN);

    use Direction::{Inbound, Outbound};
    use TcpState::*;

    match (dir, state) {
        // Bare ACK
        (Outbound, SynSent) if ack && !syn && !fin => Established,
        (Outbound, FinWait1) if ack && !syn && !fin => Closing,
        (Inbound, SynRcvd) if ack && !syn && !fin => Established,
        // Bare FIN
        (Outbound, SynRcvd | Established) if fin && !ack && !syn => FinWait1,
        (Outbound, CloseWait) if fin && !ack && !syn => LastAck,
        (Inbound, Established) if fin && !ack && !syn => CloseWait,
        // FIN+ACK
        (Inbound, FinWait1) if fin && ack && !syn => FinWait2,
        (Outbound, Established) if fin && ack && !syn => CloseWait,
        _ => state,
    }
}
