//! RTP packet framing (RFC 3550) and the little RTCP parsing the pipeline
//! needs (sender reports for the stream's real-time start).

/// RTP protocol version.
pub const RTP_VERSION: u8 = 2;

/// Fixed RTP header length without CSRCs or extensions.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parses a header, returning it together with the payload offset.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < RTP_HEADER_LEN {
            return None;
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return None;
        }

        let header = Self {
            version,
            padding: (buf[0] & 0x20) != 0,
            extension: (buf[0] & 0x10) != 0,
            csrc_count: buf[0] & 0x0F,
            marker: (buf[1] & 0x80) != 0,
            payload_type: buf[1] & 0x7F,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        let mut offset = RTP_HEADER_LEN + header.csrc_count as usize * 4;
        if buf.len() < offset {
            return None;
        }

        if header.extension {
            if buf.len() < offset + 4 {
                return None;
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if buf.len() < offset {
                return None;
            }
        }

        Some((header, offset))
    }

    /// Serializes the fixed 12-byte header (no CSRCs, no extension).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push((RTP_VERSION << 6) | ((self.padding as u8) << 5));
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }
}

/// A parsed RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Parses a complete RTP packet, stripping padding if present.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (header, offset) = RtpHeader::parse(buf)?;

        let mut end = buf.len();
        if header.padding {
            let pad = *buf.last()? as usize;
            if pad == 0 || offset + pad > end {
                return None;
            }
            end -= pad;
        }

        Some(Self {
            header,
            payload: buf[offset..end].to_vec(),
        })
    }

    /// Serializes header plus payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Returns true when a datagram on a muxed RTP/RTCP socket is RTCP
/// (packet types 192-223, RFC 5761 §4).
pub fn is_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 2 && (192..=223).contains(&buf[1])
}

/// The fields of an RTCP Sender Report the pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    /// 64-bit NTP timestamp (32.32 fixed point).
    pub ntp: u64,
    pub rtp_timestamp: u32,
}

/// Parses an RTCP Sender Report (packet type 200). Returns `None` for any
/// other RTCP packet.
pub fn parse_sender_report(buf: &[u8]) -> Option<SenderReport> {
    // 8-byte RTCP header + 20 bytes of sender info.
    if buf.len() < 28 || buf[0] >> 6 != RTP_VERSION || buf[1] != 200 {
        return None;
    }

    Some(SenderReport {
        ssrc: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        ntp: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        rtp_timestamp: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
    })
}

/// Builds a minimal RTCP compound packet (Sender Report + SDES CNAME).
pub fn build_sender_report(
    ssrc: u32,
    ntp: u64,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
    cname: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);

    // SR: version 2, no reception report blocks.
    out.push(0x80);
    out.push(200);
    out.extend_from_slice(&6u16.to_be_bytes()); // length in words - 1
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(&ntp.to_be_bytes());
    out.extend_from_slice(&rtp_timestamp.to_be_bytes());
    out.extend_from_slice(&packet_count.to_be_bytes());
    out.extend_from_slice(&octet_count.to_be_bytes());

    // SDES with one chunk carrying a CNAME item.
    let cname = cname.as_bytes();
    let item_len = 2 + cname.len();
    // chunk = ssrc + item + terminator, padded to a word boundary
    let chunk_len = 4 + item_len + 1;
    let padded = chunk_len.div_ceil(4) * 4;
    out.push(0x81);
    out.push(202);
    out.extend_from_slice(&((padded / 4) as u16).to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.push(1); // CNAME
    out.push(cname.len() as u8);
    out.extend_from_slice(cname);
    out.resize(out.len() + padded - chunk_len + 1, 0);

    out
}
