//! Link-layer collaborator seam.
//!
//! The router neither opens sockets nor owns devices; the embedder
//! supplies something that can put a raw Ethernet frame on the wire.
//! Frame reception is push-based through [`Router::handle_frame`]
//! (delivered serially by the embedder).
//!
//! [`Router::handle_frame`]: crate::Router::handle_frame

use crate::error::RouterError;

/// Transmits raw Ethernet frames on a named interface.
///
/// `send_frame` may block; it is never called with a router lock held.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[u8], iface: &str) -> Result<(), RouterError>;
}
