//! RTP demuxer worker: reads an Opus-over-RTP stream described by an SDP
//! blob and feeds conditioned packets to its output queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::conditioner::{ConditionerStats, PacketConditioner};
use super::spawn_worker;
use crate::error::{Error, Result};
use crate::message::{CodecId, CodecParams, ControlMessage, Packet};
use crate::queue::{MessageQueue, QueueError};
use crate::rtp::{ReceiverStats, RtpEvent, RtpReceiver, SessionDescription};
use crate::time::unix_micros;

/// Socket wait cap, so the shutdown flag is observed promptly even with a
/// long tick interval.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

const MAX_WARNING_COUNT: u32 = 10;

/// Exit report of the RTP demuxer thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpDemuxStats {
    pub conditioner: ConditionerStats,
    pub transport: ReceiverStats,
    /// Packets dropped because the output queue was full.
    pub dropped_queue_full: u64,
    pub ticks: u64,
}

/// Handle to a running RTP demuxer thread.
pub struct RtpDemuxerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<Result<RtpDemuxStats>>,
}

impl RtpDemuxerHandle {
    /// Signals shutdown and joins the thread.
    pub fn stop(self) -> Result<RtpDemuxStats> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join
            .join()
            .map_err(|_| Error::ThreadLost("rtp demuxer".into()))?
    }
}

/// Opens the RTP input described by `sdp` and spawns the demuxer thread.
/// A `Tick` is emitted on the output queue every `tick_interval` as a
/// keep-alive; on thread exit the queue's receive side is closed.
pub(crate) fn start_rtp_demuxer(
    sdp: &str,
    tick_interval: Duration,
    out: MessageQueue<ControlMessage>,
) -> Result<RtpDemuxerHandle> {
    let session = SessionDescription::parse(sdp)?;

    if session.codec_name != "opus" {
        warn!(
            codec = %session.codec_name,
            "expected audio stream to be opus, continuing anyway"
        );
    }

    let receiver = RtpReceiver::bind(session.port)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let join = spawn_worker("rtp-demux", "DEMUXER", move || {
        let ret = run(receiver, &session, tick_interval, &out, &shutdown_flag);
        // Unblock consumers waiting on us.
        out.close_recv();
        ret
    })?;

    Ok(RtpDemuxerHandle { shutdown, join })
}

fn run(
    mut receiver: RtpReceiver,
    session: &SessionDescription,
    tick_interval: Duration,
    out: &MessageQueue<ControlMessage>,
    shutdown: &AtomicBool,
) -> Result<RtpDemuxStats> {
    let mut stats = RtpDemuxStats::default();
    let mut conditioner = PacketConditioner::new();
    let mut warning_count = 0u32;

    let mut posted_start_local = false;
    let mut posted_start_realtime = false;

    let params = CodecParams {
        codec: if session.codec_name == "opus" {
            CodecId::Opus
        } else {
            CodecId::Other(session.codec_name.clone())
        },
        sample_rate: session.clock_rate as i32,
        channels: session.channels,
    };
    if out.send(ControlMessage::CodecParams(params), true).is_err() {
        return Ok(stats);
    }

    let mut next_tick = Instant::now() + tick_interval;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            next_tick = now + tick_interval;
            match out.send(ControlMessage::Tick, false) {
                Ok(()) => stats.ticks += 1,
                Err(QueueError::Eof) => break,
                Err(QueueError::WouldBlock) => {
                    warn!("output queue full while posting tick");
                }
            }
        }

        let timeout = next_tick.saturating_duration_since(now).min(SHUTDOWN_POLL);
        let event = match receiver.poll(timeout) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                stats.transport = receiver.stats();
                return Err(e);
            }
        };

        match event {
            RtpEvent::SenderReport { realtime_us } => {
                if !posted_start_realtime {
                    posted_start_realtime = true;
                    let _ = out.send(ControlMessage::StartTimeRealtime(realtime_us), false);
                }
            }
            RtpEvent::Audio {
                payload_type,
                payload,
                pts,
                ..
            } => {
                if !posted_start_local {
                    posted_start_local = true;
                    let _ = out.send(ControlMessage::StartTimeLocal(unix_micros()), false);
                }

                // Only the negotiated audio stream moves on.
                if payload_type != session.payload_type {
                    continue;
                }

                let Some(pkt) = conditioner.condition(Packet::new(payload, pts, 0)) else {
                    continue;
                };

                match out.send(ControlMessage::Packet(pkt), false) {
                    Ok(()) => {}
                    Err(QueueError::Eof) => break,
                    Err(QueueError::WouldBlock) => {
                        stats.dropped_queue_full += 1;
                        if warning_count < MAX_WARNING_COUNT {
                            warning_count += 1;
                            warn!("dropping packet because output queue is full");
                        }
                    }
                }
            }
        }
    }

    conditioner.finish_stream();
    stats.conditioner = conditioner.stats();
    stats.transport = receiver.stats();

    info!(
        packets = stats.conditioner.forwarded,
        missed = stats.transport.missed,
        late = stats.transport.late,
        "rtp demuxer finished"
    );

    Ok(stats)
}
