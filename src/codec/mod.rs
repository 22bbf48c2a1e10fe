//! Opus codec bindings.
//!
//! Thin safe wrappers over libopus plus TOC (table of contents) byte
//! parsing for packet duration recovery.

mod decoder;
mod encoder;
mod ffi;
mod toc;

pub use decoder::{Decoder, DecoderError};
pub use encoder::{Application, Encoder, EncoderError};
pub use toc::{packet_duration, FrameCode, Toc};

/// Opus RTP timestamps are always at 48 kHz, regardless of the coded
/// bandwidth.
pub const OPUS_RTP_SAMPLE_RATE: i32 = 48_000;

/// Samples per channel in a 20 ms frame at 48 kHz.
pub const FRAME_SIZE_48K: i64 = 960;

/// Largest possible Opus frame: 120 ms at 48 kHz, per channel.
pub const OPUS_MAX_FRAME_SIZE: usize = 5760;

/// Largest encoded Opus packet in bytes.
pub const OPUS_MAX_PACKET_BYTES: usize = 1275;
