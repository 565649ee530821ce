//! Crate-level error aggregation.
//!
//! The subsystems keep their own typed enums (frame, envelope, handshake);
//! this module folds them into one error for hosts that want a single `?`
//! boundary.

use thiserror::Error;

/// Any engine failure.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Frame codec failure (fatal for its connection).
    #[error(transparent)]
    Frame(#[from] crate::frame::FrameError),
    /// Envelope codec failure (fatal for its request).
    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),
    /// Handshake validation failure.
    #[error(transparent)]
    Handshake(#[from] crate::handshake::HandshakeError),
    /// Upgrade negotiation failure.
    #[error(transparent)]
    Upgrade(#[from] crate::server::UpgradeError),
    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias over [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
