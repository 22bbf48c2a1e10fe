//! Ogg container parsing for Opus streams.
//!
//! The file demuxer feeds Ogg/Opus bytes pushed by the host (for example a
//! text-to-speech response) through [`PageReader`] and [`OggOpusDemuxer`]
//! to recover timestamped Opus packets.

mod demux;
mod page;
mod sync;

pub use demux::{OggOpusDemuxer, OggPacket, OpusHead};
pub use page::{flags, page_checksum, Page};
pub use sync::PageReader;
