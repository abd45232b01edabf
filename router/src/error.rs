//! Error types for the router core.
//!
//! One crate-wide enum with structured variants; every fallible operation
//! returns `Result<_, RouterError>` and propagates with `?`.

use core::fmt;

/// Main router error type
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "router errors must be handled, not silently discarded"]
pub enum RouterError {
    /// Frame or packet shorter than the header it must carry
    FrameTruncated {
        what: &'static str,
        need: usize,
        got: usize,
    },
    /// Header failed checksum verification
    HeaderChecksum {
        what: &'static str,
    },
    /// Header present but structurally invalid
    MalformedPacket {
        what: &'static str,
        reason: &'static str,
    },
    /// Frame referenced an interface the router does not own
    UnknownInterface {
        name: String,
    },
    /// NAT external port space exhausted; no new mappings can be created
    NatPortExhausted,
    /// The link layer failed to transmit a frame
    SendFailed {
        iface: String,
        detail: String,
    },
    /// Configuration file could not be parsed
    ConfigParse {
        line: usize,
        reason: &'static str,
    },
    /// Configuration parsed but is not internally consistent
    ConfigInvalid {
        reason: &'static str,
    },
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTruncated { what, need, got } => {
                write!(f, "{} truncated: need {} bytes, got {}", what, need, got)
            }
            Self::HeaderChecksum { what } => {
                write!(f, "{} checksum verification failed", what)
            }
            Self::MalformedPacket { what, reason } => {
                write!(f, "malformed {}: {}", what, reason)
            }
            Self::UnknownInterface { name } => {
                write!(f, "unknown interface {:?}", name)
            }
            Self::NatPortExhausted => {
                write!(f, "NAT external port space exhausted")
            }
            Self::SendFailed { iface, detail } => {
                write!(f, "send on {:?} failed: {}", iface, detail)
            }
            Self::ConfigParse { line, reason } => {
                write!(f, "config parse error at line {}: {}", line, reason)
            }
            Self::ConfigInvalid { reason } => {
                write!(f, "invalid configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for RouterError {}
