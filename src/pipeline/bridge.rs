//! Host-callback bridge for decoded audio.
//!
//! The decoder thread is the single producer; the host side drains every
//! pending buffer in one batch whenever it is woken. Finalizing the bridge
//! closes the receive side, so the host observes end-of-stream after one
//! last drain.

use tracing::warn;

use crate::message::AudioOutput;
use crate::queue::{MessageQueue, QueueError};

/// Queue slots between the decoder and the host.
const BRIDGE_QUEUE_SIZE: usize = 1024;

/// Creates a connected bridge pair.
pub fn audio_bridge() -> (AudioSender, AudioReceiver) {
    let queue = MessageQueue::new(BRIDGE_QUEUE_SIZE);
    (
        AudioSender {
            queue: queue.clone(),
            dropped: 0,
        },
        AudioReceiver { queue },
    )
}

/// Decoder-side handle. Sends never block; a full queue drops the buffer
/// with a warning rather than stalling the real-time path.
pub struct AudioSender {
    queue: MessageQueue<AudioOutput>,
    dropped: u64,
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        // Whatever path drops the sender, the host must observe
        // end-of-stream.
        self.queue.close_recv();
    }
}

impl AudioSender {
    pub fn send(&mut self, output: AudioOutput) {
        if self.queue.send(output, false).is_err() {
            self.dropped += 1;
            warn!("host callback queue full, dropping decoded buffer");
        }
    }

    /// Signals end-of-stream. Buffers already queued are still delivered.
    pub fn finish(&self) {
        self.queue.close_recv();
    }

    /// Buffers dropped because the host fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Host-side handle.
pub struct AudioReceiver {
    queue: MessageQueue<AudioOutput>,
}

/// Result of one [`AudioReceiver::drain`] batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// More output may arrive later.
    Open,
    /// The sender finished; no further output will arrive.
    Finished,
}

impl AudioReceiver {
    /// Blocks until at least one buffer (or end-of-stream) is available.
    pub fn recv(&self) -> Option<AudioOutput> {
        self.queue.recv(true).ok()
    }

    /// Delivers every pending buffer to `f` without blocking.
    pub fn drain(&self, mut f: impl FnMut(AudioOutput)) -> DrainState {
        loop {
            match self.queue.recv(false) {
                Ok(out) => f(out),
                Err(QueueError::WouldBlock) => return DrainState::Open,
                Err(QueueError::Eof) => return DrainState::Finished,
            }
        }
    }
}
