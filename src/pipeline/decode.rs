//! Opus decode worker: consumes demuxed packets, conceals losses, and
//! hands PCM to the host through the audio bridge.

use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use super::bridge::{audio_bridge, AudioSender};
use super::rtp_demux::{start_rtp_demuxer, RtpDemuxStats};
use super::{spawn_worker, DEFAULT_MESSAGE_QUEUE_SIZE};
use crate::codec::{Decoder, OPUS_MAX_FRAME_SIZE, OPUS_RTP_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::message::{AudioOutput, CodecParams, ControlMessage, Packet};
use crate::queue::{MessageQueue, QueueError};

/// Keep-alive interval for the demuxer feeding this worker.
const DECODE_TICK_INTERVAL: Duration = Duration::from_secs(10);

const MAX_WARNING_COUNT: u32 = 10;

/// Decode pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpDecodeConfig {
    /// Sample rate PCM is decoded to: 8000, 12000, 16000, 24000, or 48000.
    pub sample_rate: i32,
    /// Decoded channel count (1 or 2).
    pub channels: i32,
}

impl Default for RtpDecodeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
        }
    }
}

/// Exit report of the decode thread.
#[derive(Debug, Clone, Default)]
pub struct DecodeStats {
    pub packets_decoded: u64,
    pub samples_decoded: u64,
    pub missing_frames_recovered: u64,
    /// Decoded buffers dropped because the host fell behind.
    pub dropped_outputs: u64,
    /// The stream's own real-time start, if the peer reported one.
    pub start_time_realtime: Option<i64>,
    /// Wall-clock arrival of the first packet.
    pub start_time_local: Option<i64>,
    pub demuxer: Option<RtpDemuxStats>,
}

/// Decoder state machine, separate from the thread loop so loss recovery
/// can be exercised directly.
struct DecodeEngine {
    decoder: Option<Decoder>,
    sample_rate: i32,
    channels: i32,
    /// 48 kHz units per decoded sample.
    pts_scale: i64,
    expected_pts: Option<i64>,
    last_frame_size: i32,
    scratch: Vec<i16>,
    warning_count: u32,
    packets_decoded: u64,
    samples_decoded: u64,
    missing_frames_recovered: u64,
}

impl DecodeEngine {
    fn new(config: &RtpDecodeConfig) -> Result<Self> {
        if !matches!(config.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(Error::InvalidConfig(format!(
                "unsupported decode sample rate {}",
                config.sample_rate
            )));
        }
        if !matches!(config.channels, 1 | 2) {
            return Err(Error::InvalidConfig(format!(
                "unsupported channel count {}",
                config.channels
            )));
        }

        Ok(Self {
            decoder: None,
            sample_rate: config.sample_rate,
            channels: config.channels,
            pts_scale: (OPUS_RTP_SAMPLE_RATE / config.sample_rate) as i64,
            expected_pts: None,
            last_frame_size: config.sample_rate * 20 / 1000,
            scratch: vec![0i16; OPUS_MAX_FRAME_SIZE * config.channels as usize],
            warning_count: 0,
            packets_decoded: 0,
            samples_decoded: 0,
            missing_frames_recovered: 0,
        })
    }

    /// (Re)creates the decoder for a newly opened stream.
    fn set_codec_params(&mut self, _params: &CodecParams) -> Result<()> {
        self.decoder = Some(Decoder::new(self.sample_rate, self.channels)?);
        Ok(())
    }

    /// Decodes one packet, synthesizing PLC/FEC frames for any gap in
    /// front of it.
    fn handle_packet(&mut self, pkt: &Packet, emit: &mut dyn FnMut(AudioOutput)) {
        let Some(decoder) = self.decoder.as_mut() else {
            // No codec parameters yet.
            return;
        };

        let pkt_pts = pkt.pts;

        if let Some(expected) = self.expected_pts {
            if pkt_pts > expected {
                // The gap is measured in 48 kHz units; frames are sized in
                // decoder-rate samples.
                let pts_per_frame = self.last_frame_size as i64 * self.pts_scale;
                let missing = (pkt_pts - expected) / pts_per_frame;

                if missing > 0 {
                    self.missing_frames_recovered += missing as u64;

                    for i in 0..missing {
                        let recovered = if i == missing - 1 {
                            // The current packet may carry redundancy for
                            // the frame right before it.
                            decoder.recover_to(&pkt.data, &mut self.scratch, self.last_frame_size)
                        } else {
                            decoder.conceal_to(&mut self.scratch, self.last_frame_size)
                        };

                        let n = match recovered {
                            Ok(n) => n,
                            Err(e) => {
                                if self.warning_count < MAX_WARNING_COUNT {
                                    self.warning_count += 1;
                                    warn!("opus decode error during loss concealment: {}", e);
                                }
                                continue;
                            }
                        };

                        self.samples_decoded += n as u64;
                        emit(AudioOutput {
                            buffer: self.scratch[..n as usize * self.channels as usize].to_vec(),
                            pts: Some(expected + i * pts_per_frame),
                        });
                    }
                }
            }
        }

        let n = match decoder.decode_to(&pkt.data, &mut self.scratch) {
            Ok(n) => n,
            Err(e) => {
                if self.warning_count < MAX_WARNING_COUNT {
                    self.warning_count += 1;
                    warn!("opus decode error: {}", e);
                }
                return;
            }
        };

        self.last_frame_size = n;
        self.packets_decoded += 1;
        self.samples_decoded += n as u64;
        self.expected_pts = Some(pkt_pts + n as i64 * self.pts_scale);

        emit(AudioOutput {
            buffer: self.scratch[..n as usize * self.channels as usize].to_vec(),
            pts: Some(pkt_pts),
        });
    }
}

/// Handle to a running decode pipeline.
pub struct RtpDecodeHandle {
    input: MessageQueue<ControlMessage>,
    join: JoinHandle<Result<DecodeStats>>,
    dispatcher: JoinHandle<()>,
}

impl RtpDecodeHandle {
    /// Drops everything queued toward the decoder without closing it.
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

    /// Shuts the pipeline down and returns the decode report.
    pub fn stop(self) -> Result<DecodeStats> {
        self.input.close();
        let ret = self
            .join
            .join()
            .map_err(|_| Error::ThreadLost("decode".into()))?;
        let _ = self.dispatcher.join();
        ret
    }
}

/// Starts the receive pipeline: an RTP demuxer thread plus a decode
/// thread, with `on_audio` invoked for every decoded buffer on a
/// dispatcher thread standing in for the host runtime.
pub fn start_rtp_decode(
    sdp: &str,
    on_audio: impl FnMut(AudioOutput) + Send + 'static,
    config: RtpDecodeConfig,
) -> Result<RtpDecodeHandle> {
    let engine = DecodeEngine::new(&config)?;
    let input: MessageQueue<ControlMessage> = MessageQueue::new(DEFAULT_MESSAGE_QUEUE_SIZE);

    let (sender, receiver) = audio_bridge();
    let mut callback = on_audio;
    let dispatcher = spawn_worker("audio-dispatch", "MUXER", move || {
        while let Some(output) = receiver.recv() {
            callback(output);
        }
    })?;

    let demuxer = match start_rtp_demuxer(sdp, DECODE_TICK_INTERVAL, input.clone()) {
        Ok(demuxer) => demuxer,
        Err(e) => {
            sender.finish();
            return Err(e);
        }
    };

    let queue = input.clone();
    let join = match spawn_worker("opus-decode", "MUXER", move || {
        run(engine, &queue, sender, demuxer)
    }) {
        Ok(join) => join,
        Err(e) => {
            // The demuxer handle went down with the closure; closing the
            // queue it feeds makes the thread wind down on its own.
            input.close();
            return Err(e.into());
        }
    };

    Ok(RtpDecodeHandle {
        input,
        join,
        dispatcher,
    })
}

fn run(
    mut engine: DecodeEngine,
    input: &MessageQueue<ControlMessage>,
    mut bridge: AudioSender,
    demuxer: super::rtp_demux::RtpDemuxerHandle,
) -> Result<DecodeStats> {
    let mut stats = DecodeStats::default();
    let mut thread_ret = Ok(());

    loop {
        let msg = match input.recv(true) {
            Ok(msg) => msg,
            Err(QueueError::Eof) | Err(QueueError::WouldBlock) => break,
        };

        match msg {
            ControlMessage::CodecParams(params) => {
                if let Err(e) = engine.set_codec_params(&params) {
                    thread_ret = Err(e);
                    break;
                }
            }
            ControlMessage::Packet(pkt) => {
                engine.handle_packet(&pkt, &mut |out| bridge.send(out));
            }
            ControlMessage::StartTimeRealtime(t) => stats.start_time_realtime = Some(t),
            ControlMessage::StartTimeLocal(t) => stats.start_time_local = Some(t),
            ControlMessage::Tick => {}
            _ => {}
        }
    }

    // The host observes end-of-stream after one final drain.
    bridge.finish();
    input.close();

    stats.packets_decoded = engine.packets_decoded;
    stats.samples_decoded = engine.samples_decoded;
    stats.missing_frames_recovered = engine.missing_frames_recovered;
    stats.dropped_outputs = bridge.dropped();

    if stats.packets_decoded > 0 {
        info!(
            packets = stats.packets_decoded,
            samples = stats.samples_decoded,
            seconds = stats.samples_decoded as f64 / engine.sample_rate as f64,
            recovered = stats.missing_frames_recovered,
            "opus decode finished"
        );
    }

    match demuxer.stop() {
        Ok(demux_stats) => stats.demuxer = Some(demux_stats),
        Err(e) => return Err(e),
    }

    thread_ret.map(|_| stats)
}
