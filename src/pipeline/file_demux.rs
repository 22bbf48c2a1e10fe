//! File demuxer worker: parses an Ogg/Opus byte stream pushed
//! incrementally by the host (typically a text-to-speech response) and
//! feeds conditioned packets to the producer.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use super::conditioner::{ConditionerStats, PacketConditioner};
use super::{spawn_worker, FILE_DEMUXER_QUEUE_SIZE};
use crate::error::{Error, Result};
use crate::message::{CodecId, CodecParams, ControlMessage, Packet};
use crate::ogg::OggOpusDemuxer;
use crate::queue::{MessageQueue, QueueError};

/// Exit report of the file demuxer thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileDemuxStats {
    pub conditioner: ConditionerStats,
    /// Stream opens, counting one per reset.
    pub streams_opened: u64,
}

/// Flags shared between the worker loop and the byte source's read hook.
#[derive(Default)]
struct SourceFlags {
    /// A reset marker was consumed; the worker should re-open.
    reset_requested: AtomicBool,
    /// Set while (re)initializing, so nested reset markers are ignored.
    resetting: AtomicBool,
}

/// Pulls byte chunks from the input queue for the Ogg parser.
///
/// A chunk larger than the parser's read buffer is split across
/// successive reads through the carry buffer, so producers are not bound
/// by the reader's buffer size.
struct ByteSource {
    input: MessageQueue<ControlMessage>,
    flags: Arc<SourceFlags>,
    carry: Vec<u8>,
    carry_pos: usize,
}

impl ByteSource {
    fn new(input: MessageQueue<ControlMessage>, flags: Arc<SourceFlags>) -> Self {
        Self {
            input,
            flags,
            carry: Vec::new(),
            carry_pos: 0,
        }
    }

    /// Drops bytes belonging to the stream being abandoned on reset.
    fn discard_carry(&mut self) {
        self.carry.clear();
        self.carry_pos = 0;
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.carry_pos < self.carry.len() {
                let n = buf.len().min(self.carry.len() - self.carry_pos);
                buf[..n].copy_from_slice(&self.carry[self.carry_pos..self.carry_pos + n]);
                self.carry_pos += n;
                if self.carry_pos == self.carry.len() {
                    self.discard_carry();
                }
                return Ok(n);
            }

            match self.input.recv(true) {
                Ok(ControlMessage::OggBytes(bytes)) => {
                    if bytes.len() <= buf.len() {
                        buf[..bytes.len()].copy_from_slice(&bytes);
                        return Ok(bytes.len());
                    }
                    self.carry = bytes;
                    self.carry_pos = 0;
                }
                Ok(ControlMessage::OggReset) => {
                    // Ignore resets that arrive while a re-open is
                    // already in progress; acting on them would surface
                    // an empty stream to the parser.
                    if self.flags.resetting.load(Ordering::Relaxed) {
                        continue;
                    }
                    self.flags.reset_requested.store(true, Ordering::Relaxed);
                    return Ok(0);
                }
                Ok(ControlMessage::Eof) => return Ok(0),
                Ok(other) => {
                    warn!(?other, "unexpected message on byte stream queue");
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected message type on byte stream queue",
                    ));
                }
                Err(_) => return Ok(0),
            }
        }
    }
}

/// Handle to a running file demuxer thread.
pub struct FileDemuxHandle {
    input: MessageQueue<ControlMessage>,
    join: JoinHandle<Result<FileDemuxStats>>,
}

impl FileDemuxHandle {
    /// Feeds a chunk of the Ogg byte stream. Blocks while the byte queue
    /// is full, putting backpressure on the source; returns `false` once
    /// the pipeline is closed.
    pub fn push_bytes(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        self.input
            .send(ControlMessage::OggBytes(bytes.to_vec()), true)
            .is_ok()
    }

    /// Requests a re-open against a fresh byte stream.
    pub fn reset(&self) {
        if self
            .input
            .send(ControlMessage::OggReset, false)
            .is_err()
        {
            warn!("byte stream queue full while posting reset");
        }
    }

    /// Ends the byte stream; the demuxer drains and exits.
    pub fn post_end_of_file(&self) {
        self.input.close();
    }

    /// Same as [`Self::post_end_of_file`]; mirrors an abort signal firing.
    pub fn abort(&self) {
        self.post_end_of_file();
    }

    /// Drops any unread byte chunks without closing the stream.
    pub fn clear_message_queue(&self) {
        self.input.drain();
    }

    /// Shuts the demuxer down and returns its report.
    pub fn stop(self) -> Result<FileDemuxStats> {
        self.input.close();
        self.join
            .join()
            .map_err(|_| Error::ThreadLost("file demuxer".into()))?
    }
}

/// Starts the file demuxer. Packets go to `out` with blocking sends; the
/// output queue is owned by its consumer (usually a producer) and is left
/// open on exit.
pub fn start_file_demux(out: MessageQueue<ControlMessage>) -> Result<FileDemuxHandle> {
    let input: MessageQueue<ControlMessage> = MessageQueue::new(FILE_DEMUXER_QUEUE_SIZE);

    let queue = input.clone();
    let join = spawn_worker("file-demux", "DEMUXER", move || run(&queue, &out))?;

    Ok(FileDemuxHandle { input, join })
}

fn run(
    input: &MessageQueue<ControlMessage>,
    out: &MessageQueue<ControlMessage>,
) -> Result<FileDemuxStats> {
    let mut stats = FileDemuxStats::default();
    let mut conditioner = PacketConditioner::new();

    let flags = Arc::new(SourceFlags::default());
    let mut source = ByteSource::new(input.clone(), Arc::clone(&flags));

    'streams: loop {
        flags.resetting.store(true, Ordering::Relaxed);
        flags.reset_requested.store(false, Ordering::Relaxed);

        let mut demuxer = match OggOpusDemuxer::open(&mut source) {
            Ok(Some(demuxer)) => demuxer,
            // Byte stream ended before a stream could be opened.
            Ok(None) => break,
            Err(e) => {
                return Err(Error::Ogg(e.to_string()));
            }
        };

        stats.streams_opened += 1;
        let params = CodecParams {
            codec: CodecId::Opus,
            sample_rate: 48_000,
            channels: demuxer.head().channels as i32,
        };
        if out.send(ControlMessage::CodecParams(params), true).is_err() {
            break;
        }

        flags.resetting.store(false, Ordering::Relaxed);

        loop {
            match demuxer.next_packet() {
                Ok(Some(p)) => {
                    let pkt = Packet::new(p.data, p.pts, p.duration);
                    let Some(pkt) = conditioner.condition(pkt) else {
                        continue;
                    };
                    match out.send(ControlMessage::Packet(pkt), true) {
                        Ok(()) => {}
                        Err(QueueError::Eof) | Err(QueueError::WouldBlock) => break 'streams,
                    }
                }
                // Reset or end of the byte stream.
                Ok(None) => break,
                Err(e) => return Err(Error::Ogg(e.to_string())),
            }
        }

        conditioner.finish_stream();
        drop(demuxer);

        if flags.reset_requested.load(Ordering::Relaxed) {
            source.discard_carry();
            continue;
        }
        break;
    }

    stats.conditioner = conditioner.stats();
    info!(
        packets = stats.conditioner.forwarded,
        streams = stats.streams_opened,
        "file demuxer finished"
    );

    Ok(stats)
}
