use std::io;

use thiserror::Error;

/// Errors returned while constructing or driving verbs streams.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected before any device resource was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The device cannot provide a required capability or capacity.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// A verbs call failed during setup.
    #[error("{op} failed: {source}")]
    Device {
        /// Name of the failing verb (e.g. `ibv_create_qp`).
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// Other system-level failure (socket, mmap, io_uring).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn device(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Device { op, source }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed received frame. Logged and skipped, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame is not Ethernet/IPv4/UDP, or is fragmented.
    #[error("{0}")]
    PacketType(&'static str),
    /// Frame is shorter than its headers claim.
    #[error("{0}")]
    Length(&'static str),
}
