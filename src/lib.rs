//! Bidirectional real-time Opus/RTP audio pipeline.
//!
//! `opuswire` moves audio between an external RTP/SRTP endpoint (a WebRTC
//! or conversational-AI peer) and in-process producers/consumers:
//!
//! - **Receive**: an RTP demuxer and an Opus decoder with packet loss
//!   concealment deliver PCM to a host callback
//!   ([`start_rtp_decode`]).
//! - **Send**: host PCM is encoded to 20 ms Opus frames and written as
//!   RTP/SRTP with real-time pacing ([`start_rtp_encode`]).
//! - **Synthesized speech**: an externally fed Ogg/Opus byte stream is
//!   demuxed into timestamped packets and paced out the same producer
//!   ([`start_file_demux`], [`start_producer`]).
//!
//! Each worker owns one OS thread; workers communicate only through
//! bounded [`MessageQueue`]s of [`ControlMessage`]s. Closing a worker's
//! input queue is the shutdown signal: the worker drains, tears down its
//! codec state, and exits with a report.
//!
//! # Example
//!
//! ```no_run
//! use opuswire::{start_rtp_decode, RtpDecodeConfig};
//!
//! # fn main() -> opuswire::Result<()> {
//! let handle = start_rtp_decode(
//!     sdp_from_peer(),
//!     |audio| println!("{} samples at pts {:?}", audio.buffer.len(), audio.pts),
//!     RtpDecodeConfig { sample_rate: 24000, channels: 1 },
//! )?;
//!
//! // ... later ...
//! let stats = handle.stop()?;
//! println!("decoded {} packets", stats.packets_decoded);
//! # Ok(())
//! # }
//! # fn sdp_from_peer() -> &'static str { "" }
//! ```

pub mod codec;
mod error;
mod message;
pub mod ogg;
mod pipeline;
mod queue;
pub mod rtp;
pub mod time;

pub use error::{Error, Result};
pub use message::{AudioOutput, CodecId, CodecParams, ControlMessage, Packet};
pub use pipeline::bridge::{audio_bridge, AudioReceiver, AudioSender, DrainState};
pub use pipeline::conditioner::{ConditionerStats, PacketConditioner};
pub use pipeline::{
    start_file_demux, start_producer, start_rtp_decode, start_rtp_encode, DecodeStats,
    EncodeStats, FileDemuxHandle, FileDemuxStats, ProduceStats, ProducerConfig, ProducerHandle,
    RtpDecodeConfig, RtpDecodeHandle, RtpDemuxStats, RtpEncodeConfig, RtpEncodeHandle,
};
pub use queue::{MessageQueue, QueueError};
