//! UDP send/receive sessions for RTP audio.

use std::io;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use super::packet::{
    build_sender_report, is_rtcp, parse_sender_report, RtpHeader, RtpPacket,
};
use super::srtp::SrtpContext;
use crate::error::{Error, Result};
use crate::time::{ntp_to_realtime, realtime_to_ntp, unix_micros};

const RECV_BUF_SIZE: usize = 2048;

/// Interval between outbound RTCP sender reports.
const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Transport-level receive counters, reported with the demuxer's exit
/// status rather than logged per packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// RTP packets accepted.
    pub packets: u64,
    /// Packets the sequence numbers say we never saw.
    pub missed: u64,
    /// Packets that arrived behind the highest sequence seen (late or
    /// duplicate); dropped silently.
    pub late: u64,
}

/// One event surfaced by [`RtpReceiver::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtpEvent {
    /// An RTP packet in arrival order. `pts` is the unwrapped RTP
    /// timestamp relative to the first accepted packet, in clock-rate
    /// (48 kHz for Opus) units.
    Audio {
        payload_type: u8,
        payload: Vec<u8>,
        pts: i64,
        marker: bool,
    },
    /// An RTCP sender report mapped to microseconds since the Unix epoch.
    SenderReport { realtime_us: i64 },
}

/// Receives RTP (and muxed RTCP) datagrams on a bound UDP socket.
pub struct RtpReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
    stats: ReceiverStats,
    highest_seq: Option<u16>,
    last_ts: u32,
    last_ext_ts: i64,
    base_ext_ts: Option<i64>,
}

impl RtpReceiver {
    /// Binds the receive socket on the SDP's audio port.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(Self {
            socket,
            buf: vec![0u8; RECV_BUF_SIZE],
            stats: ReceiverStats::default(),
            highest_seq: None,
            last_ts: 0,
            last_ext_ts: 0,
            base_ext_ts: None,
        })
    }

    /// Waits up to `timeout` for a datagram. Returns `Ok(None)` on
    /// timeout or when the datagram was consumed internally (late
    /// packets, unrecognized RTCP).
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<RtpEvent>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let len = match self.socket.recv(&mut self.buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let datagram = &self.buf[..len];

        if is_rtcp(datagram) {
            if let Some(sr) = parse_sender_report(datagram) {
                return Ok(Some(RtpEvent::SenderReport {
                    realtime_us: ntp_to_realtime(sr.ntp),
                }));
            }
            return Ok(None);
        }

        let Some(packet) = RtpPacket::parse(datagram) else {
            return Ok(None);
        };
        let header = &packet.header;

        // Sequence accounting. Late and duplicate packets are counted and
        // dropped without a log line; gaps only bump the missed counter.
        if let Some(highest) = self.highest_seq {
            let delta = header.sequence_number.wrapping_sub(highest) as i16;
            if delta <= 0 {
                self.stats.late += 1;
                return Ok(None);
            }
            self.stats.missed += delta as u64 - 1;
        }
        self.highest_seq = Some(header.sequence_number);

        // Unwrap the 32-bit RTP timestamp into a monotone extended
        // timestamp anchored at the first accepted packet.
        let ext = match self.base_ext_ts {
            None => {
                self.base_ext_ts = Some(header.timestamp as i64);
                header.timestamp as i64
            }
            Some(_) => {
                let delta = header.timestamp.wrapping_sub(self.last_ts) as i32;
                self.last_ext_ts + delta as i64
            }
        };
        self.last_ts = header.timestamp;
        self.last_ext_ts = ext;
        self.stats.packets += 1;

        Ok(Some(RtpEvent::Audio {
            payload_type: header.payload_type,
            payload: packet.payload,
            pts: ext - self.base_ext_ts.unwrap(),
            marker: header.marker,
        }))
    }

    /// Transport counters accumulated so far.
    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }
}

/// Sends an Opus RTP stream, optionally SRTP-protected, over UDP.
pub struct RtpSender {
    socket: UdpSocket,
    ssrc: u32,
    payload_type: u8,
    cname: String,
    srtp: Option<SrtpContext>,
    seq: u16,
    sent_any: bool,
    last_ts: u32,
    packet_count: u32,
    octet_count: u32,
    last_report: Instant,
}

impl RtpSender {
    /// Opens the output. `url` must be `rtp://host:port`; SRTP is enabled
    /// when `srtp` carries a protection context.
    pub fn open(
        url: &str,
        ssrc: u32,
        payload_type: u8,
        cname: String,
        srtp: Option<SrtpContext>,
    ) -> Result<Self> {
        let target = url
            .strip_prefix("rtp://")
            .ok_or_else(|| Error::Rtp(format!("unsupported output url '{}'", url)))?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket
            .connect(target)
            .map_err(|e| Error::Rtp(format!("cannot reach '{}': {}", target, e)))?;

        Ok(Self {
            socket,
            ssrc,
            payload_type,
            cname,
            srtp,
            seq: 0,
            sent_any: false,
            last_ts: 0,
            packet_count: 0,
            octet_count: 0,
            last_report: Instant::now(),
        })
    }

    /// Writes one Opus packet with the given 48 kHz presentation
    /// timestamp. Any error is terminal for the stream.
    pub fn write(&mut self, payload: &[u8], pts: i64) -> Result<()> {
        let header = RtpHeader {
            version: super::RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            // Marker flags the first packet of the talkspurt.
            marker: !self.sent_any,
            payload_type: self.payload_type,
            sequence_number: self.seq,
            timestamp: pts as u32,
            ssrc: self.ssrc,
        };

        let mut datagram = RtpPacket {
            header,
            payload: payload.to_vec(),
        }
        .serialize();

        if let Some(srtp) = &mut self.srtp {
            srtp.protect(&mut datagram)?;
        }

        self.socket.send(&datagram)?;
        self.seq = self.seq.wrapping_add(1);
        self.sent_any = true;
        self.last_ts = pts as u32;
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload.len() as u32);

        self.maybe_send_report();
        Ok(())
    }

    /// Emits a periodic RTCP sender report on the muxed socket. Skipped
    /// under SRTP, where control packets would need separate SRTCP
    /// protection.
    fn maybe_send_report(&mut self) {
        if self.srtp.is_some() || self.last_report.elapsed() < SENDER_REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();

        let report = build_sender_report(
            self.ssrc,
            realtime_to_ntp(unix_micros()),
            self.last_ts,
            self.packet_count,
            self.octet_count,
            &self.cname,
        );
        // Report loss is harmless; the media path carries on.
        let _ = self.socket.send(&report);
    }
}
