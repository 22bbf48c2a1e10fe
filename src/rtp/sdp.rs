//! Minimal SDP parsing for the RTP demuxer.
//!
//! Only the fields this pipeline consumes are extracted: the connection
//! address, the audio media port, and the negotiated payload type with its
//! `a=rtpmap` codec description. The SDP may be supplied inline or wrapped
//! in a `data:application/sdp;base64,…` URL, as hosts tend to hand it over.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{Error, Result};

/// The negotiated audio stream description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Connection address from the session or media `c=` line.
    pub address: String,
    /// Audio media port.
    pub port: u16,
    /// Negotiated RTP payload type (first format in the `m=audio` line).
    pub payload_type: u8,
    /// Codec name from `a=rtpmap`, lower-cased; empty when absent.
    pub codec_name: String,
    /// RTP clock rate; 48000 when no rtpmap is present.
    pub clock_rate: u32,
    /// Channel count from the rtpmap encoding parameters; defaults to 2.
    pub channels: i32,
}

impl SessionDescription {
    /// Parses an SDP blob, accepting either raw SDP text or a
    /// `data:` URL with base64 payload.
    pub fn parse(input: &str) -> Result<Self> {
        let text = unwrap_data_url(input)?;

        let mut address = None;
        let mut media: Option<(u16, u8)> = None;
        let mut codec_name = String::new();
        let mut clock_rate = 48_000u32;
        let mut channels = 2i32;
        let mut in_audio_section = false;
        let mut saw_media = false;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };

            match kind {
                "c" => {
                    // c=IN IP4 192.0.2.1
                    if !saw_media || in_audio_section {
                        if let Some(addr) = value.split_whitespace().nth(2) {
                            address = Some(addr.to_string());
                        }
                    }
                }
                "m" => {
                    saw_media = true;
                    let mut fields = value.split_whitespace();
                    let media_type = fields.next().unwrap_or("");
                    if media_type == "audio" && media.is_none() {
                        let port = fields
                            .next()
                            .and_then(|p| p.parse::<u16>().ok())
                            .ok_or_else(|| Error::Sdp("invalid audio port".into()))?;
                        let _proto = fields.next();
                        let pt = fields
                            .next()
                            .and_then(|p| p.parse::<u8>().ok())
                            .ok_or_else(|| Error::Sdp("missing audio payload type".into()))?;
                        media = Some((port, pt));
                        in_audio_section = true;
                    } else {
                        in_audio_section = false;
                    }
                }
                "a" => {
                    if !in_audio_section {
                        continue;
                    }
                    // a=rtpmap:111 opus/48000/2
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        let mut parts = rest.split_whitespace();
                        let pt_matches = parts
                            .next()
                            .and_then(|p| p.parse::<u8>().ok())
                            .map(|pt| media.map(|(_, want)| want == pt).unwrap_or(false))
                            .unwrap_or(false);
                        if !pt_matches {
                            continue;
                        }
                        if let Some(encoding) = parts.next() {
                            let mut enc = encoding.split('/');
                            codec_name = enc.next().unwrap_or("").to_ascii_lowercase();
                            if let Some(rate) = enc.next().and_then(|r| r.parse().ok()) {
                                clock_rate = rate;
                            }
                            if let Some(ch) = enc.next().and_then(|c| c.parse().ok()) {
                                channels = ch;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let (port, payload_type) =
            media.ok_or_else(|| Error::Sdp("no audio media section".into()))?;
        let address = address.ok_or_else(|| Error::Sdp("no connection address".into()))?;

        Ok(Self {
            address,
            port,
            payload_type,
            codec_name,
            clock_rate,
            channels,
        })
    }
}

fn unwrap_data_url(input: &str) -> Result<String> {
    let Some(rest) = input.strip_prefix("data:") else {
        return Ok(input.to_string());
    };

    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::Sdp("malformed data url".into()))?;

    if meta.ends_with(";base64") {
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| Error::Sdp(format!("base64 decode failed: {}", e)))?;
        String::from_utf8(bytes).map_err(|_| Error::Sdp("sdp is not valid utf-8".into()))
    } else {
        Ok(payload.to_string())
    }
}
