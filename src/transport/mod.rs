//! Pluggable packet transport.
//!
//! The connection consumes a [`HeaderTransport`]: an unreliable, unordered
//! in principle (in practice FIFO per direction) half-connection that moves
//! whole headers. Errors bubble up and abort the connection quietly. The
//! simulation pipe in [`crate::sandbox`] is the reference implementation;
//! a UDP-backed one plugs in the same way.

use crate::packet::Header;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A bidirectional header pipe. Implementations must tolerate concurrent
/// writers: the write pipeline owns the data path, but control packets on
/// the teardown path may be written from the read loop.
pub trait HeaderTransport: Send + Sync + 'static {
    fn write_header(&self, header: &Header) -> Result<(), TransportError>;
    fn read_header(&self) -> Result<Header, TransportError>;
    /// Closes both directions: subsequent writes fail and, after draining,
    /// reads on both ends return [`TransportError::Closed`].
    fn close(&self);
}
