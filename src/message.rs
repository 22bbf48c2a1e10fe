//! Messages exchanged between pipeline workers.
//!
//! Every inter-thread edge carries [`ControlMessage`] values through a
//! bounded [`MessageQueue`](crate::MessageQueue). Payloads are owned by the
//! message; ownership transfers on enqueue/dequeue, and undelivered
//! payloads are released when a queue is dropped.

/// An Opus-framed unit with timestamps in the 48 kHz RTP clock domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Opus packet bytes (TOC byte first).
    pub data: Vec<u8>,
    /// Presentation timestamp, 48 kHz samples.
    pub pts: i64,
    /// Decode timestamp. Always equal to `pts` for Opus.
    pub dts: i64,
    /// Duration in 48 kHz samples.
    pub duration: i64,
}

impl Packet {
    /// Creates a packet with `dts == pts`.
    pub fn new(data: Vec<u8>, pts: i64, duration: i64) -> Self {
        Self {
            data,
            pts,
            dts: pts,
            duration,
        }
    }
}

/// Codec identity negotiated by a demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecId {
    Opus,
    Other(String),
}

/// Stream parameters sent once from a demuxer to its consumer after each
/// successful stream open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub codec: CodecId,
    pub sample_rate: i32,
    pub channels: i32,
}

/// A decoded PCM run handed to the host.
///
/// `pts` is in 48 kHz samples when the stream carries timestamps; `None`
/// means unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOutput {
    pub buffer: Vec<i16>,
    pub pts: Option<i64>,
}

/// The tagged message variant carried by every pipeline queue.
///
/// Receivers match exhaustively and ignore variants that do not concern
/// them; dropping an unhandled message releases its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// An Opus packet moving toward a decoder or producer.
    Packet(Packet),
    /// Raw PCM bytes (little-endian s16, mono) for the encoder.
    Pcm(Vec<u8>),
    /// A chunk of an Ogg/Opus byte stream for the file demuxer.
    OggBytes(Vec<u8>),
    /// Re-open the file demuxer against a fresh byte stream.
    OggReset,
    /// Stream parameters, posted once per stream open.
    CodecParams(CodecParams),
    /// The stream's own real-time start, microseconds since the Unix epoch.
    StartTimeRealtime(i64),
    /// Wall-clock arrival of the first packet, microseconds since the Unix
    /// epoch.
    StartTimeLocal(i64),
    /// Periodic keep-alive from the RTP demuxer.
    Tick,
    /// Set the encoder bitrate (<= 0 selects the automatic bitrate).
    SetBitrate(i32),
    /// Enable or disable in-band FEC on the encoder.
    SetFec(bool),
    /// Expected packet loss percentage hint for the encoder.
    SetPacketLossPct(i32),
    /// Encode and emit any partial frame, then reset the PTS origin.
    FlushEncoder,
    /// Drop everything queued toward the producer.
    ClearProducerQueue,
    /// End of the byte stream feeding the file demuxer.
    Eof,
}
