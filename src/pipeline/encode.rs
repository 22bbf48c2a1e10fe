//! Opus encode worker: accumulates host PCM into 20 ms frames, encodes,
//! and posts timestamped packets to the RTP producer.

use std::thread::JoinHandle;

use tracing::{info, warn};

use super::produce::{spawn_producer, ProduceStats, ProducerConfig};
use super::{spawn_worker, DEFAULT_MESSAGE_QUEUE_SIZE, PRODUCER_QUEUE_SIZE};
use crate::codec::{Application, Encoder, FRAME_SIZE_48K, OPUS_MAX_PACKET_BYTES};
use crate::error::{Error, Result};
use crate::message::{ControlMessage, Packet};
use crate::queue::{MessageQueue, QueueError};

const MAX_WARNING_COUNT: u32 = 10;

/// Bitrate used when the host passes no explicit value at startup.
const DEFAULT_BITRATE: i32 = 32_000;

/// Send pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpEncodeConfig {
    /// RTP output URL (`rtp://host:port`).
    pub rtp_url: String,
    pub ssrc: u32,
    pub payload_type: u8,
    pub cname: String,
    /// SRTP crypto suite name; `None` sends plain RTP.
    pub crypto_suite: Option<String>,
    /// Base64 SRTP master key and salt.
    pub key_base64: Option<String>,
    /// Target bitrate in bits per second; <= 0 selects the default.
    pub bitrate: i32,
    pub enable_fec: bool,
    pub packet_loss_percent: i32,
    /// Sample rate of the PCM the host will post.
    pub sample_rate: i32,
}

/// Exit report of the encode thread.
#[derive(Debug, Clone, Default)]
pub struct EncodeStats {
    pub frames_encoded: u64,
    pub samples_encoded: u64,
    pub producer: Option<ProduceStats>,
}

/// Frame accumulation and encoding, separate from the thread loop.
///
/// The encoder itself runs stereo: mono input samples are duplicated into
/// both channels. Output PTS advances by one 20 ms frame (960 samples at
/// 48 kHz) per packet regardless of the input rate.
struct EncodeEngine {
    encoder: Encoder,
    frame_size_input: usize,
    accum: Vec<i16>,
    stereo: Vec<i16>,
    packet_buf: Vec<u8>,
    frame_index: i64,
    warning_count: u32,
    frames_encoded: u64,
    samples_encoded: u64,
}

impl EncodeEngine {
    fn new(config: &RtpEncodeConfig) -> Result<Self> {
        if !matches!(config.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(Error::InvalidConfig(format!(
                "unsupported encode sample rate {}",
                config.sample_rate
            )));
        }

        let mut encoder = Encoder::new(config.sample_rate, 2, Application::VoIP)?;
        encoder.set_bitrate(if config.bitrate > 0 {
            config.bitrate
        } else {
            DEFAULT_BITRATE
        })?;
        encoder.set_inband_fec(config.enable_fec)?;
        encoder.set_packet_loss_perc(config.packet_loss_percent)?;

        let frame_size_input = (config.sample_rate * 20 / 1000) as usize;

        Ok(Self {
            encoder,
            frame_size_input,
            accum: Vec::with_capacity(frame_size_input),
            stereo: vec![0i16; frame_size_input * 2],
            packet_buf: vec![0u8; OPUS_MAX_PACKET_BYTES],
            frame_index: 0,
            warning_count: 0,
            frames_encoded: 0,
            samples_encoded: 0,
        })
    }

    /// Appends little-endian s16 mono bytes, emitting a packet for every
    /// completed 20 ms frame.
    fn push_pcm(&mut self, bytes: &[u8], emit: &mut dyn FnMut(Packet)) {
        for pair in bytes.chunks_exact(2) {
            self.accum.push(i16::from_le_bytes([pair[0], pair[1]]));
            if self.accum.len() >= self.frame_size_input {
                self.encode_frame(emit);
            }
        }
    }

    /// Zero-pads and emits any partial frame, then resets the PTS origin.
    /// The producer's rebase path recovers the resulting timeline restart.
    fn flush(&mut self, emit: &mut dyn FnMut(Packet)) {
        if !self.accum.is_empty() {
            self.accum.resize(self.frame_size_input, 0);
            self.encode_frame(emit);
        }
        self.frame_index = 0;
    }

    fn encode_frame(&mut self, emit: &mut dyn FnMut(Packet)) {
        for (i, &sample) in self.accum.iter().enumerate() {
            self.stereo[i * 2] = sample;
            self.stereo[i * 2 + 1] = sample;
        }

        let len = match self.encoder.encode_to(
            &self.stereo,
            self.frame_size_input as i32,
            &mut self.packet_buf,
        ) {
            Ok(len) => len,
            Err(e) => {
                if self.warning_count < MAX_WARNING_COUNT {
                    self.warning_count += 1;
                    warn!("opus encode error: {}", e);
                }
                self.accum.clear();
                return;
            }
        };

        let pkt = Packet::new(
            self.packet_buf[..len].to_vec(),
            self.frame_index * FRAME_SIZE_48K,
            FRAME_SIZE_48K,
        );
        emit(pkt);

        self.frame_index += 1;
        self.frames_encoded += 1;
        self.samples_encoded += self.frame_size_input as u64;
        self.accum.clear();
    }
}

/// Handle to a running encode pipeline (encoder plus embedded producer).
pub struct RtpEncodeHandle {
    input: MessageQueue<ControlMessage>,
    join: JoinHandle<Result<EncodeStats>>,
}

impl RtpEncodeHandle {
    /// Posts mono s16 PCM bytes for encoding. Returns `false` when the
    /// encoder queue is full and the buffer was dropped.
    pub fn post_pcm(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        match self.input.send(ControlMessage::Pcm(bytes.to_vec()), false) {
            Ok(()) => true,
            Err(QueueError::WouldBlock) => {
                warn!("dropping PCM buffer because encoder queue is full");
                false
            }
            Err(QueueError::Eof) => false,
        }
    }

    /// Encodes and emits any partial frame, restarting the PTS origin.
    pub fn post_flush_encoder(&self) {
        let _ = self.input.send(ControlMessage::FlushEncoder, false);
    }

    /// Drops every packet queued toward the producer.
    pub fn post_clear_producer_queue(&self) {
        let _ = self.input.send(ControlMessage::ClearProducerQueue, false);
    }

    pub fn post_set_bitrate(&self, bitrate: i32) {
        let _ = self.input.send(ControlMessage::SetBitrate(bitrate), false);
    }

    pub fn post_set_enable_fec(&self, enable: bool) {
        let _ = self.input.send(ControlMessage::SetFec(enable), false);
    }

    pub fn post_set_packet_loss_percent(&self, percent: i32) {
        let _ = self
            .input
            .send(ControlMessage::SetPacketLossPct(percent), false);
    }

    /// Drops everything queued toward the encoder without closing it.
    pub fn clear_message_queue(&self) {
        self.input.drain();
    }

    /// Closes the pipeline's input; workers wind down after draining.
    pub fn post_end_of_file(&self) {
        self.input.close();
    }

    /// Same as [`Self::post_end_of_file`]; mirrors an abort signal firing.
    pub fn abort(&self) {
        self.post_end_of_file();
    }

    /// Shuts the pipeline down and returns the encode report.
    pub fn stop(self) -> Result<EncodeStats> {
        self.input.close();
        self.join
            .join()
            .map_err(|_| Error::ThreadLost("encode".into()))?
    }
}

/// Starts the send pipeline: an encode thread feeding an embedded RTP
/// producer thread.
pub fn start_rtp_encode(config: RtpEncodeConfig) -> Result<RtpEncodeHandle> {
    let engine = EncodeEngine::new(&config)?;
    let input: MessageQueue<ControlMessage> = MessageQueue::new(DEFAULT_MESSAGE_QUEUE_SIZE);

    let producer_config = ProducerConfig {
        url: config.rtp_url.clone(),
        ssrc: config.ssrc,
        payload_type: config.payload_type,
        cname: config.cname.clone(),
        crypto_suite: config.crypto_suite.clone(),
        key_base64: config.key_base64.clone(),
    };

    let queue = input.clone();
    let join = spawn_worker("opus-encode", "ENCODER", move || {
        run(engine, &queue, producer_config)
    })?;

    Ok(RtpEncodeHandle { input, join })
}

fn run(
    mut engine: EncodeEngine,
    input: &MessageQueue<ControlMessage>,
    producer_config: ProducerConfig,
) -> Result<EncodeStats> {
    let producer = spawn_producer(producer_config, PRODUCER_QUEUE_SIZE)?;
    let producer_queue = producer.queue();

    let mut send_warnings = 0u32;
    let mut emit = |pkt: Packet| {
        // Blocking is safe here: this thread has nothing else to do, and
        // the producer closes its queue when it dies.
        if producer_queue.send(ControlMessage::Packet(pkt), true).is_err() && send_warnings < MAX_WARNING_COUNT
        {
            send_warnings += 1;
            warn!("failed to post packet to producer");
        }
    };

    loop {
        let msg = match input.recv(true) {
            Ok(msg) => msg,
            Err(QueueError::Eof) | Err(QueueError::WouldBlock) => break,
        };

        match msg {
            ControlMessage::Pcm(bytes) => engine.push_pcm(&bytes, &mut emit),
            ControlMessage::FlushEncoder => engine.flush(&mut emit),
            ControlMessage::ClearProducerQueue => {
                producer.queue().drain();
            }
            ControlMessage::SetBitrate(bitrate) => {
                if let Err(e) = engine.encoder.set_bitrate(bitrate) {
                    warn!("failed to set bitrate: {}", e);
                }
            }
            ControlMessage::SetFec(enable) => {
                if let Err(e) = engine.encoder.set_inband_fec(enable) {
                    warn!("failed to set fec: {}", e);
                }
            }
            ControlMessage::SetPacketLossPct(percent) => {
                if let Err(e) = engine.encoder.set_packet_loss_perc(percent) {
                    warn!("failed to set packet loss percentage: {}", e);
                }
            }
            ControlMessage::Eof => break,
            _ => {}
        }
    }

    let mut stats = EncodeStats {
        frames_encoded: engine.frames_encoded,
        samples_encoded: engine.samples_encoded,
        producer: None,
    };

    info!(
        frames = stats.frames_encoded,
        samples = stats.samples_encoded,
        seconds = stats.samples_encoded as f64 / engine.encoder.sample_rate() as f64,
        "opus encode finished"
    );

    match producer.stop() {
        Ok(produce_stats) => stats.producer = Some(produce_stats),
        Err(e) => return Err(e),
    }

    Ok(stats)
}
