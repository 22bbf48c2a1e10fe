//! RTP producer worker: rebases packet timestamps onto its own wall
//! clock, paces output to real time, and writes RTP/SRTP to the network.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{spawn_worker, STANDALONE_PRODUCER_QUEUE_SIZE};
use crate::error::{Error, Result};
use crate::message::{ControlMessage, Packet};
use crate::queue::{MessageQueue, QueueError};
use crate::rtp::{RtpSender, SrtpContext};
use crate::time::{rescale, MICROSECONDS};

/// 48 kHz RTP clock for Opus.
const OPUS_SAMPLE_RATE: i64 = 48_000;

/// The maximum amount of audio sent ahead of real time: 100 ms at 48 kHz.
/// Larger look-ahead makes receivers play back too fast after a stall.
const MAX_FUTURE: i64 = OPUS_SAMPLE_RATE / 10;

const MAX_WARNING_COUNT: u32 = 10;

/// RTP/SRTP output configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Output URL (`rtp://host:port`).
    pub url: String,
    pub ssrc: u32,
    pub payload_type: u8,
    pub cname: String,
    /// SRTP crypto suite name; `None` sends plain RTP.
    pub crypto_suite: Option<String>,
    /// Base64 SRTP master key and salt, passed through verbatim.
    pub key_base64: Option<String>,
}

/// Exit report of the producer thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProduceStats {
    pub packets_written: u64,
    /// Packets dropped to protect downstream muxers from PTS regressions.
    pub packets_dropped: u64,
    /// Number of timeline rebases (including the initial one).
    pub rebases: u64,
}

/// The producer's clock state: maps incoming packet timelines onto the
/// wall clock, detecting source restarts.
struct ProducerClock {
    stream_start: Instant,
    rebase_pts: Option<i64>,
    last_in_pts: Option<i64>,
    next_expected_pts: Option<i64>,
    rebases: u64,
}

/// Verdict for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    /// Write after sleeping for the given duration (possibly zero) at the
    /// rebased timestamp.
    Write { pts: i64, sleep: Duration },
    /// Drop: the packet would regress behind what was already written.
    Drop,
}

impl ProducerClock {
    fn new(stream_start: Instant) -> Self {
        Self {
            stream_start,
            rebase_pts: None,
            last_in_pts: None,
            next_expected_pts: None,
            rebases: 0,
        }
    }

    /// Wall-clock position on the 48 kHz timeline.
    fn now_pts(&self) -> i64 {
        let elapsed = self.stream_start.elapsed().as_micros() as i64;
        rescale(OPUS_SAMPLE_RATE, elapsed, MICROSECONDS)
    }

    fn schedule(&mut self, pkt: &Packet, now_pts: i64) -> Schedule {
        // A PTS at or below the previous one means the source restarted
        // its timeline; remap it onto the wall clock.
        if self.rebase_pts.is_none() || Some(pkt.pts) <= self.last_in_pts {
            // Up to MAX_FUTURE may already be in flight, so the previous
            // stream's end can lie ahead of the wall clock. Align the new
            // baseline to it so no gap is introduced, clamped to the
            // look-ahead bound.
            let mut base = now_pts;
            if let Some(next) = self.next_expected_pts {
                if next > now_pts {
                    let max_pts = now_pts + MAX_FUTURE;
                    if next > max_pts {
                        warn!(
                            next_expected_pts = next,
                            now_pts, "next expected pts is too far ahead of the clock"
                        );
                        base = max_pts;
                    } else {
                        base = next;
                    }
                }
            }

            // The correction lands the triggering packet exactly on the
            // baseline.
            let rebase = base - pkt.pts;
            info!(
                old_rebase_pts = self.rebase_pts,
                new_rebase_pts = rebase,
                pts = pkt.pts,
                last_pts = self.last_in_pts,
                "resetting producer timeline to wallclock"
            );
            self.rebase_pts = Some(rebase);
            self.rebases += 1;
            // Do not compare the new stream's PTS against the old
            // stream's expectation.
            self.next_expected_pts = None;
        }

        self.last_in_pts = Some(pkt.pts);

        let rebase = self.rebase_pts.unwrap();
        let pts = pkt.pts + rebase;

        let future = pts - now_pts;
        let sleep = if future > MAX_FUTURE {
            Duration::from_micros(rescale(MICROSECONDS, future - MAX_FUTURE, OPUS_SAMPLE_RATE) as u64)
        } else {
            Duration::ZERO
        };

        // A stop/start race can still move pts backwards; the muxer
        // would abort on it, so the packet has to go.
        if let Some(next) = self.next_expected_pts {
            if pts < next {
                return Schedule::Drop;
            }
        }
        self.next_expected_pts = Some(pts + pkt.duration);

        Schedule::Write { pts, sleep }
    }
}

/// Handle to a running producer thread.
pub struct ProducerHandle {
    queue: MessageQueue<ControlMessage>,
    join: JoinHandle<Result<ProduceStats>>,
}

impl ProducerHandle {
    /// The producer's input queue; packet sources send here.
    pub fn queue(&self) -> MessageQueue<ControlMessage> {
        self.queue.clone()
    }

    /// Drops everything queued toward the producer without closing it.
    pub fn clear_message_queue(&self) {
        self.queue.drain();
    }

    /// Closes the input; the producer drains what is queued and exits.
    pub fn post_end_of_file(&self) {
        self.queue.close();
    }

    /// Same as [`Self::post_end_of_file`]; mirrors an abort signal firing.
    pub fn abort(&self) {
        self.post_end_of_file();
    }

    /// Shuts the producer down and returns its report.
    pub fn stop(self) -> Result<ProduceStats> {
        self.queue.close();
        self.join
            .join()
            .map_err(|_| Error::ThreadLost("producer".into()))?
    }
}

/// Starts a standalone, network-facing producer with a deep input queue.
pub fn start_producer(config: ProducerConfig) -> Result<ProducerHandle> {
    spawn_producer(config, STANDALONE_PRODUCER_QUEUE_SIZE)
}

/// Spawns the producer thread with the given queue depth.
pub(crate) fn spawn_producer(config: ProducerConfig, queue_size: usize) -> Result<ProducerHandle> {
    let queue: MessageQueue<ControlMessage> = MessageQueue::new(queue_size);

    let worker_queue = queue.clone();
    let join = spawn_worker("rtp-produce", "PRODUCER", move || {
        let ret = run(&config, &worker_queue);
        // Whatever happened, unblock both sides.
        worker_queue.close();
        ret
    })?;

    Ok(ProducerHandle { queue, join })
}

fn run(config: &ProducerConfig, queue: &MessageQueue<ControlMessage>) -> Result<ProduceStats> {
    let srtp = match (&config.crypto_suite, &config.key_base64) {
        (Some(suite), Some(key)) => Some(SrtpContext::from_base64(suite, key)?),
        (Some(_), None) | (None, Some(_)) => {
            return Err(Error::Srtp(
                "crypto suite and key must be provided together".into(),
            ));
        }
        (None, None) => None,
    };

    let mut sender = RtpSender::open(
        &config.url,
        config.ssrc,
        config.payload_type,
        config.cname.clone(),
        srtp,
    )?;

    let mut clock = ProducerClock::new(Instant::now());
    let mut stats = ProduceStats::default();
    let mut warning_count = 0u32;

    loop {
        let msg = match queue.recv(true) {
            Ok(msg) => msg,
            // Expected at shutdown: drain finished.
            Err(QueueError::Eof) | Err(QueueError::WouldBlock) => break,
        };

        let ControlMessage::Packet(pkt) = msg else {
            continue;
        };

        match clock.schedule(&pkt, clock.now_pts()) {
            Schedule::Drop => {
                stats.packets_dropped += 1;
                if warning_count < MAX_WARNING_COUNT {
                    warning_count += 1;
                    warn!(pts = pkt.pts, "dropping packet behind expected pts");
                }
            }
            Schedule::Write { pts, sleep, .. } => {
                if !sleep.is_zero() {
                    std::thread::sleep(sleep);
                }
                // Write errors during streaming are terminal.
                sender.write(&pkt.data, pts)?;
                stats.packets_written += 1;
            }
        }
    }

    stats.rebases = clock.rebases;
    info!(
        written = stats.packets_written,
        dropped = stats.packets_dropped,
        rebases = stats.rebases,
        "rtp producer finished"
    );

    Ok(stats)
}
