//! Error types for opuswire.

use std::io;

/// Result type alias for opuswire.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipeline operations.
///
/// Per-packet problems (decode errors, malformed TOC bytes, out-of-order
/// timestamps, full queues on real-time paths) are not represented here;
/// workers log those and drop the packet. An `Error` is fatal for the
/// thread that returns it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// SDP could not be parsed.
    #[error("sdp error: {0}")]
    Sdp(String),

    /// Invalid RTP output URL or transport setup failure.
    #[error("rtp error: {0}")]
    Rtp(String),

    /// SRTP configuration or key material problem.
    #[error("srtp error: {0}")]
    Srtp(String),

    /// Malformed Ogg stream.
    #[error("ogg error: {0}")]
    Ogg(String),

    /// Opus decoder error.
    #[error(transparent)]
    Decoder(#[from] crate::codec::DecoderError),

    /// Opus encoder error.
    #[error(transparent)]
    Encoder(#[from] crate::codec::EncoderError),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Worker thread panicked or could not be joined.
    #[error("worker thread lost: {0}")]
    ThreadLost(String),
}
