//! Packet conditioning shared by both demuxers.
//!
//! Every packet leaving a demuxer passes through the same gauntlet: empty
//! packets out, missing durations recovered from the Opus TOC byte,
//! out-of-order and inconsistent timestamps dropped, a one-time negative
//! PTS correction, and an offset that keeps the output timeline continuous
//! across stream re-opens.

use tracing::warn;

use crate::codec::packet_duration;
use crate::message::Packet;

/// Cap on repeated per-packet warnings for one stream.
const MAX_WARNING_COUNT: u32 = 10;

/// Per-packet drop counters, folded into the demuxer's exit report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConditionerStats {
    pub forwarded: u64,
    pub dropped_empty: u64,
    pub dropped_malformed: u64,
    pub dropped_out_of_order: u64,
    pub dropped_inconsistent: u64,
}

/// Stateful conditioning for one demuxer output stream.
pub struct PacketConditioner {
    /// Carried across stream re-opens so the timeline stays continuous.
    pts_offset: i64,
    /// Per-stream state, reset by [`PacketConditioner::finish_stream`].
    prev_pts: Option<i64>,
    pts_correction: Option<i64>,
    next_expected_pts: Option<i64>,
    warning_count: u32,
    stats: ConditionerStats,
}

impl PacketConditioner {
    pub fn new() -> Self {
        Self {
            pts_offset: 0,
            prev_pts: None,
            pts_correction: None,
            next_expected_pts: None,
            warning_count: 0,
            stats: ConditionerStats::default(),
        }
    }

    /// Runs one packet through the checks. Returns the corrected packet,
    /// or `None` when it must be dropped.
    pub fn condition(&mut self, mut pkt: Packet) -> Option<Packet> {
        // Some peers emit periodic empty packets with duplicate
        // timestamps; forwarding them would trip the order checks
        // downstream.
        if pkt.data.is_empty() {
            self.stats.dropped_empty += 1;
            return None;
        }

        // The RTP transport does not carry durations; recover them from
        // the TOC byte.
        if pkt.duration == 0 {
            match packet_duration(&pkt.data) {
                Some(d) => pkt.duration = d,
                None => {
                    self.stats.dropped_malformed += 1;
                    self.warn_limited(|| {
                        warn!(size = pkt.data.len(), "dropping packet with malformed TOC");
                    });
                    return None;
                }
            }
        }

        // Downstream consumers abort on regressions, so out-of-order
        // packets are dropped here.
        if let Some(prev) = self.prev_pts {
            if pkt.pts < prev {
                self.stats.dropped_out_of_order += 1;
                self.warn_limited(|| {
                    warn!(
                        prev_pts = prev,
                        pts = pkt.pts,
                        dts = pkt.dts,
                        duration = pkt.duration,
                        size = pkt.data.len(),
                        "received packet with timestamps out of order"
                    );
                });
                return None;
            }
        }
        self.prev_pts = Some(pkt.pts);

        if pkt.pts != pkt.dts {
            self.stats.dropped_inconsistent += 1;
            self.warn_limited(|| {
                warn!(
                    pts = pkt.pts,
                    dts = pkt.dts,
                    "received packet with mismatched timestamps"
                );
            });
            return None;
        }

        // Streams whose first packets lost their durations upstream start
        // with a negative PTS; shift the whole stream so it begins at 0.
        let correction = *self.pts_correction.get_or_insert_with(|| {
            if pkt.pts < 0 {
                -pkt.pts
            } else {
                0
            }
        });
        pkt.pts += correction;
        pkt.dts += correction;

        pkt.pts += self.pts_offset;
        pkt.dts += self.pts_offset;
        self.next_expected_pts = Some(pkt.pts + pkt.duration);

        self.stats.forwarded += 1;
        Some(pkt)
    }

    /// Ends the current stream: the next stream's packets continue where
    /// this one left off, and the per-stream checks start fresh.
    pub fn finish_stream(&mut self) {
        if let Some(next) = self.next_expected_pts.take() {
            self.pts_offset = next;
        }
        self.prev_pts = None;
        self.pts_correction = None;
        self.warning_count = 0;
    }

    pub fn stats(&self) -> ConditionerStats {
        self.stats
    }

    fn warn_limited(&mut self, emit: impl FnOnce()) {
        if self.warning_count < MAX_WARNING_COUNT {
            self.warning_count += 1;
            emit();
        }
    }
}

impl Default for PacketConditioner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 20 ms mono SILK frame (config 1, code 0): duration 960 at 48 kHz.
    fn frame(pts: i64) -> Packet {
        Packet::new(vec![0x08, 0, 0], pts, 0)
    }

    #[test]
    fn test_duration_repair_from_toc() {
        let mut c = PacketConditioner::new();
        let out = c.condition(frame(0)).unwrap();
        assert_eq!(out.duration, 960);
    }

    #[test]
    fn test_existing_duration_kept() {
        let mut c = PacketConditioner::new();
        let mut pkt = frame(0);
        pkt.duration = 480;
        assert_eq!(c.condition(pkt).unwrap().duration, 480);
    }

    #[test]
    fn test_empty_packet_dropped() {
        let mut c = PacketConditioner::new();
        assert!(c.condition(Packet::new(Vec::new(), 0, 0)).is_none());
        assert_eq!(c.stats().dropped_empty, 1);
    }

    #[test]
    fn test_malformed_toc_dropped() {
        let mut c = PacketConditioner::new();
        // Code 3 without a frame count byte.
        assert!(c.condition(Packet::new(vec![0x0B], 0, 0)).is_none());
        assert_eq!(c.stats().dropped_malformed, 1);
    }

    #[test]
    fn test_out_of_order_dropped() {
        let mut c = PacketConditioner::new();
        assert_eq!(c.condition(frame(100)).unwrap().pts, 100);
        assert!(c.condition(frame(90)).is_none());
        assert_eq!(c.condition(frame(110)).unwrap().pts, 110);
        assert_eq!(c.stats().dropped_out_of_order, 1);
        assert_eq!(c.stats().forwarded, 2);
    }

    #[test]
    fn test_mismatched_dts_dropped() {
        let mut c = PacketConditioner::new();
        let mut pkt = frame(100);
        pkt.dts = 90;
        assert!(c.condition(pkt).is_none());
        assert_eq!(c.stats().dropped_inconsistent, 1);
    }

    #[test]
    fn test_negative_pts_corrected_to_zero_origin() {
        let mut c = PacketConditioner::new();
        let out = c.condition(frame(-312)).unwrap();
        assert_eq!(out.pts, 0);
        assert_eq!(out.dts, 0);

        // Correction applies to every subsequent packet.
        let out = c.condition(frame(648)).unwrap();
        assert_eq!(out.pts, 960);
    }

    #[test]
    fn test_non_negative_first_pts_uncorrected() {
        let mut c = PacketConditioner::new();
        assert_eq!(c.condition(frame(960)).unwrap().pts, 960);
        assert_eq!(c.condition(frame(1920)).unwrap().pts, 1920);
    }

    #[test]
    fn test_offset_continuity_across_streams() {
        let mut c = PacketConditioner::new();
        assert_eq!(c.condition(frame(0)).unwrap().pts, 0);
        assert_eq!(c.condition(frame(960)).unwrap().pts, 960);
        c.finish_stream();

        // The new stream restarts at 0 but the output timeline continues.
        let out = c.condition(frame(0)).unwrap();
        assert_eq!(out.pts, 1920);

        c.finish_stream();
        let out = c.condition(frame(0)).unwrap();
        assert_eq!(out.pts, 2880);
    }

    #[test]
    fn test_new_stream_order_check_is_fresh() {
        let mut c = PacketConditioner::new();
        assert!(c.condition(frame(5000)).is_some());
        c.finish_stream();

        // Lower raw pts than the previous stream's is fine after a reset.
        assert!(c.condition(frame(0)).is_some());
    }

    #[test]
    fn test_warning_cap() {
        let mut c = PacketConditioner::new();
        c.condition(frame(10_000)).unwrap();
        for _ in 0..20 {
            assert!(c.condition(frame(0)).is_none());
        }
        assert_eq!(c.warning_count, MAX_WARNING_COUNT);
        assert_eq!(c.stats().dropped_out_of_order, 20);
    }
}
