//! Opus packet extraction from an Ogg stream.

use std::collections::VecDeque;
use std::io::{self, Read};

use tracing::warn;

use super::page::Page;
use super::sync::PageReader;
use crate::codec::packet_duration;

/// Identification header of an Ogg Opus stream (RFC 7845 §5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHead {
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
}

impl OpusHead {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 19 || &data[..8] != b"OpusHead" {
            return None;
        }
        Some(Self {
            channels: data[9],
            pre_skip: u16::from_le_bytes(data[10..12].try_into().unwrap()),
            input_sample_rate: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }
}

/// An Opus packet recovered from the container, timestamped in 48 kHz
/// samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggPacket {
    pub data: Vec<u8>,
    pub pts: i64,
    pub duration: i64,
}

/// Demuxes Opus packets out of an Ogg byte stream.
///
/// Packets are reassembled across page boundaries from the segment lacing
/// values. PTS comes from the stream's granule positions: the first data
/// page anchors the timeline at `granule − Σ durations`, and packets then
/// advance by their TOC durations. (The anchor can be negative when the
/// encoder folded pre-skip into the first granule; downstream conditioning
/// corrects that.)
pub struct OggOpusDemuxer<R: Read> {
    pages: PageReader<R>,
    head: OpusHead,
    saw_tags: bool,
    /// Partially assembled packet continuing across pages.
    partial: Vec<u8>,
    /// True while discarding an orphan continuation we never saw the
    /// start of.
    skipping_orphan: bool,
    next_pts: Option<i64>,
    ready: VecDeque<OggPacket>,
}

impl<R: Read> OggOpusDemuxer<R> {
    /// Opens the stream, reading pages until the OpusHead identification
    /// header is found. Returns `Ok(None)` if the byte stream ends first.
    pub fn open(reader: R) -> io::Result<Option<Self>> {
        let mut pages = PageReader::new(reader);

        loop {
            let page = match pages.read_page()? {
                Some(p) => p,
                None => return Ok(None),
            };

            let mut packets = Vec::new();
            let mut partial = Vec::new();
            split_packets(&page, &mut partial, &mut false, &mut packets);

            if let Some(first) = packets.first() {
                match OpusHead::parse(first) {
                    Some(head) => {
                        return Ok(Some(Self {
                            pages,
                            head,
                            saw_tags: false,
                            partial: Vec::new(),
                            skipping_orphan: false,
                            next_pts: None,
                            ready: VecDeque::new(),
                        }));
                    }
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "stream does not begin with OpusHead",
                        ));
                    }
                }
            }
        }
    }

    /// Returns the stream's identification header.
    pub fn head(&self) -> &OpusHead {
        &self.head
    }

    /// Returns the next Opus packet, or `Ok(None)` at end of the byte
    /// stream.
    pub fn next_packet(&mut self) -> io::Result<Option<OggPacket>> {
        loop {
            if let Some(pkt) = self.ready.pop_front() {
                return Ok(Some(pkt));
            }

            let page = match self.pages.read_page()? {
                Some(p) => p,
                None => return Ok(None),
            };
            self.process_page(&page);
        }
    }

    fn process_page(&mut self, page: &Page) {
        if page.is_continuation() {
            if self.partial.is_empty() && !self.skipping_orphan {
                // Continuation of a packet we never started; eat segments
                // until the orphan completes.
                self.skipping_orphan = true;
            }
        } else if !self.partial.is_empty() {
            warn!(
                bytes = self.partial.len(),
                "discarding unterminated packet at page boundary"
            );
            self.partial.clear();
        }

        let mut completed = Vec::new();
        split_packets(
            page,
            &mut self.partial,
            &mut self.skipping_orphan,
            &mut completed,
        );

        let mut audio = Vec::new();
        for data in completed {
            if data.len() >= 8 && &data[..8] == b"OpusTags" && !self.saw_tags {
                self.saw_tags = true;
                continue;
            }
            if data.len() >= 8 && &data[..8] == b"OpusHead" {
                // A stray header mid-stream carries no audio.
                continue;
            }
            match packet_duration(&data) {
                Some(duration) => audio.push((data, duration)),
                None => warn!("dropping Opus packet with malformed TOC"),
            }
        }

        if audio.is_empty() {
            return;
        }

        // Anchor the timeline on the first page that completes audio
        // packets: the page granule marks the end of its last packet.
        if self.next_pts.is_none() {
            let total: i64 = audio.iter().map(|(_, d)| d).sum();
            self.next_pts = Some(page.granule_position - total);
        }

        let mut pts = self.next_pts.unwrap();
        for (data, duration) in audio {
            self.ready.push_back(OggPacket {
                data,
                pts,
                duration,
            });
            pts += duration;
        }
        self.next_pts = Some(pts);
    }
}

/// Walks a page's lacing values, appending body slices to `partial` and
/// moving completed packets into `completed`. While `skipping` is set,
/// segments are discarded until the orphan packet they belong to ends.
fn split_packets(
    page: &Page,
    partial: &mut Vec<u8>,
    skipping: &mut bool,
    completed: &mut Vec<Vec<u8>>,
) {
    let mut offset = 0usize;
    for &lacing in &page.segment_table {
        let len = lacing as usize;
        let end = (offset + len).min(page.body.len());
        if !*skipping {
            partial.extend_from_slice(&page.body[offset..end]);
        }
        offset = end;

        if lacing < 255 {
            if *skipping {
                *skipping = false;
            } else {
                completed.push(std::mem::take(partial));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{
        opus_head_packet, opus_tags_packet, write_page, write_page_raw,
    };
    use super::*;
    use std::io::Cursor;

    fn opus_head() -> Vec<u8> {
        opus_head_packet(1)
    }

    fn opus_tags() -> Vec<u8> {
        opus_tags_packet()
    }

    /// A 20 ms (960 samples at 48 kHz) mono SILK packet: config 1, code 0.
    fn frame_20ms(fill: u8) -> Vec<u8> {
        vec![0x08, fill, fill]
    }

    fn stream_with_frames(granule_of_first_page: i64, frames: &[Vec<u8>]) -> Vec<u8> {
        let mut data = Vec::new();
        write_page(&mut data, 0x02, 0, 1, 0, &[&opus_head()]);
        write_page(&mut data, 0, 0, 1, 1, &[&opus_tags()]);
        let refs: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
        write_page(&mut data, 0, granule_of_first_page, 1, 2, &refs);
        data
    }

    #[test]
    fn test_open_parses_head() {
        let data = stream_with_frames(1920, &[frame_20ms(1), frame_20ms(2)]);
        let demux = OggOpusDemuxer::open(Cursor::new(data)).unwrap().unwrap();
        assert_eq!(demux.head().channels, 1);
        assert_eq!(demux.head().pre_skip, 312);
        assert_eq!(demux.head().input_sample_rate, 48000);
    }

    #[test]
    fn test_packets_skip_headers_and_carry_pts() {
        let data = stream_with_frames(1920, &[frame_20ms(1), frame_20ms(2)]);
        let mut demux = OggOpusDemuxer::open(Cursor::new(data)).unwrap().unwrap();

        let p1 = demux.next_packet().unwrap().unwrap();
        assert_eq!(p1.pts, 0);
        assert_eq!(p1.duration, 960);
        assert_eq!(p1.data, frame_20ms(1));

        let p2 = demux.next_packet().unwrap().unwrap();
        assert_eq!(p2.pts, 960);

        assert!(demux.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_negative_anchor_from_preskip_granule() {
        // Granule smaller than the page's packet durations yields a
        // negative first PTS, as upstream encoders produce.
        let data = stream_with_frames(1608, &[frame_20ms(1), frame_20ms(2)]);
        let mut demux = OggOpusDemuxer::open(Cursor::new(data)).unwrap().unwrap();

        let p1 = demux.next_packet().unwrap().unwrap();
        assert_eq!(p1.pts, 1608 - 1920);
        let p2 = demux.next_packet().unwrap().unwrap();
        assert_eq!(p2.pts, 1608 - 960);
    }

    #[test]
    fn test_packet_continued_across_pages() {
        let big = {
            let mut p = vec![0x08];
            p.extend(std::iter::repeat(0x55).take(400));
            p
        };

        let mut data = Vec::new();
        write_page(&mut data, 0x02, 0, 1, 0, &[&opus_head()]);
        write_page(&mut data, 0, 0, 1, 1, &[&opus_tags()]);
        // First 255 bytes on one page (lacing 255 = unterminated), the
        // remaining 146 on a continuation page.
        write_page_raw(&mut data, 0, 0, 1, 2, &[255], &big[..255]);
        write_page_raw(&mut data, 0x01, 960, 1, 3, &[146], &big[255..]);

        let mut demux = OggOpusDemuxer::open(Cursor::new(data)).unwrap().unwrap();
        let p = demux.next_packet().unwrap().unwrap();
        assert_eq!(p.data, big);
        assert_eq!(p.pts, 0);
        assert_eq!(p.duration, 960);
    }

    #[test]
    fn test_orphan_continuation_skipped() {
        let mut data = Vec::new();
        write_page(&mut data, 0x02, 0, 1, 0, &[&opus_head()]);
        write_page(&mut data, 0, 0, 1, 1, &[&opus_tags()]);
        // Continuation page for a packet whose start was never seen, then
        // a complete frame on the same page.
        let mut body = vec![0xEE; 100];
        body.extend_from_slice(&frame_20ms(7));
        write_page_raw(&mut data, 0x01, 960, 1, 2, &[100, 3], &body);

        let mut demux = OggOpusDemuxer::open(Cursor::new(data)).unwrap().unwrap();
        let p = demux.next_packet().unwrap().unwrap();
        assert_eq!(p.data, frame_20ms(7));
        assert!(demux.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_open_eof_returns_none() {
        assert!(OggOpusDemuxer::open(Cursor::new(Vec::<u8>::new()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_open_rejects_non_opus() {
        let mut data = Vec::new();
        write_page(&mut data, 0x02, 0, 1, 0, &[b"vorbis-ish".as_ref()]);
        assert!(OggOpusDemuxer::open(Cursor::new(data)).is_err());
    }
}
