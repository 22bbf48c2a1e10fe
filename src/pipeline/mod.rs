//! The worker pipeline: demuxers, codec workers, and the RTP producer,
//! each on its own OS thread, connected by bounded message queues.

pub mod bridge;
pub mod conditioner;
mod decode;
mod encode;
mod file_demux;
mod produce;
mod rtp_demux;

pub use decode::{start_rtp_decode, DecodeStats, RtpDecodeConfig, RtpDecodeHandle};
pub use encode::{start_rtp_encode, EncodeStats, RtpEncodeConfig, RtpEncodeHandle};
pub use file_demux::{start_file_demux, FileDemuxHandle, FileDemuxStats};
pub use produce::{start_producer, ProduceStats, ProducerConfig, ProducerHandle};
pub use rtp_demux::{RtpDemuxStats, RtpDemuxerHandle};

use std::io;
use std::thread::{Builder, JoinHandle};

use tracing::error;

/// Default depth of a worker's input queue.
pub const DEFAULT_MESSAGE_QUEUE_SIZE: usize = 1024;

/// Producer input queue when the producer is co-hosted with an encoder
/// thread that paces itself against it.
pub const PRODUCER_QUEUE_SIZE: usize = 1024;

/// Producer input queue for a standalone, network-facing producer: the
/// producer drains in real time, so the queue absorbs whole bursts.
pub const STANDALONE_PRODUCER_QUEUE_SIZE: usize = 8192;

/// Byte-chunk input queue for the file demuxer. Long synthesized-speech
/// responses arrive faster than real time.
pub const FILE_DEMUXER_QUEUE_SIZE: usize = 2048;

/// Reads the per-role stack size override from `<ROLE>_THREAD_STACK_SIZE`.
/// Unset or invalid values fall back to the platform default.
fn stack_size_for_thread(role: &str) -> Option<usize> {
    let name = format!("{}_THREAD_STACK_SIZE", role);
    let value = std::env::var(&name).ok()?;
    match value.parse::<usize>() {
        Ok(size) if size > 0 => Some(size),
        _ => {
            error!("invalid value for {}", name);
            None
        }
    }
}

/// Spawns a named worker thread, honoring the role's stack size override.
fn spawn_worker<T, F>(name: &str, role: &str, f: F) -> io::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let mut builder = Builder::new().name(name.to_string());
    if let Some(size) = stack_size_for_thread(role) {
        builder = builder.stack_size(size);
    }
    builder.spawn(f)
}
