//! End-to-end pipeline tests over loopback UDP.

use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opuswire::codec::{Application, Encoder};
use opuswire::ogg::page_checksum;
use opuswire::rtp::{is_rtcp, RtpPacket, RtpSender};
use opuswire::{
    start_file_demux, start_producer, start_rtp_decode, start_rtp_encode, AudioOutput,
    ControlMessage, Packet, ProducerConfig, RtpDecodeConfig, RtpEncodeConfig,
};

/// Reserves a local UDP port. Racy in principle, standard for tests.
fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn sdp_for_port(port: u16) -> String {
    format!(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=audio\r\nc=IN IP4 127.0.0.1\r\n\
         t=0 0\r\nm=audio {} RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\n",
        port
    )
}

fn encode_config(port: u16, sample_rate: i32) -> RtpEncodeConfig {
    RtpEncodeConfig {
        rtp_url: format!("rtp://127.0.0.1:{}", port),
        ssrc: 0x1234,
        payload_type: 111,
        cname: "opuswire-test".into(),
        crypto_suite: None,
        key_base64: None,
        bitrate: 32000,
        enable_fec: false,
        packet_loss_percent: 0,
        sample_rate,
    }
}

/// Little-endian s16 mono PCM bytes.
fn pcm_bytes(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| (((i * 17) % 4000) as i16 - 2000).to_le_bytes())
        .collect()
}

/// Receives RTP datagrams (skipping RTCP) until `count` have arrived.
fn recv_rtp(socket: &UdpSocket, count: usize, total_timeout: Duration) -> Vec<RtpPacket> {
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let deadline = Instant::now() + total_timeout;
    let mut buf = [0u8; 2048];
    let mut packets = Vec::new();

    while packets.len() < count && Instant::now() < deadline {
        match socket.recv(&mut buf) {
            Ok(len) => {
                if is_rtcp(&buf[..len]) {
                    continue;
                }
                if let Some(pkt) = RtpPacket::parse(&buf[..len]) {
                    packets.push(pkt);
                }
            }
            Err(_) => continue,
        }
    }
    packets
}

#[test]
fn encode_pipeline_paces_to_real_time() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = receiver.local_addr().unwrap().port();

    let started = Instant::now();
    let handle = start_rtp_encode(encode_config(port, 24000)).unwrap();

    // 50 frames of 20 ms: one second of audio, delivered all at once.
    for chunk in pcm_bytes(480 * 50).chunks(9600) {
        assert!(handle.post_pcm(chunk));
    }

    let packets = recv_rtp(&receiver, 50, Duration::from_secs(5));
    let elapsed = started.elapsed();
    assert_eq!(packets.len(), 50);

    // The producer holds at most 100 ms of look-ahead, so one second of
    // audio cannot finish much before the 900 ms mark.
    assert!(
        elapsed >= Duration::from_millis(850),
        "finished too fast: {:?}",
        elapsed
    );

    // Marker on the first packet of the stream, then sequential
    // sequence numbers and 20 ms timestamp steps.
    assert!(packets[0].header.marker);
    for pair in packets.windows(2) {
        assert!(!pair[1].header.marker);
        assert_eq!(
            pair[1].header.sequence_number,
            pair[0].header.sequence_number.wrapping_add(1)
        );
        assert_eq!(pair[1].header.timestamp, pair[0].header.timestamp + 960);
    }

    let stats = handle.stop().unwrap();
    assert_eq!(stats.frames_encoded, 50);
    let producer = stats.producer.unwrap();
    assert_eq!(producer.packets_written, 50);
    assert_eq!(producer.packets_dropped, 0);
}

#[test]
fn encoder_flush_restarts_timeline_without_regression() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = receiver.local_addr().unwrap().port();

    let handle = start_rtp_encode(encode_config(port, 24000)).unwrap();

    // Two full frames, then a partial one that only a flush completes.
    assert!(handle.post_pcm(&pcm_bytes(960)));
    assert!(handle.post_pcm(&pcm_bytes(120)));
    handle.post_flush_encoder();

    // After the flush the encoder's pts origin is back at 0; the
    // producer rebases instead of emitting a regression.
    assert!(handle.post_pcm(&pcm_bytes(480)));

    let packets = recv_rtp(&receiver, 4, Duration::from_secs(3));
    assert_eq!(packets.len(), 4);

    let ts: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
    for pair in ts.windows(2) {
        assert!(pair[0] < pair[1], "timestamps not increasing: {:?}", ts);
    }

    let stats = handle.stop().unwrap();
    assert_eq!(stats.frames_encoded, 4);
    assert_eq!(stats.producer.unwrap().packets_dropped, 0);
}

#[test]
fn encode_pipeline_with_srtp_protects_payload() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut config = encode_config(port, 24000);
    config.crypto_suite = Some("AES_CM_128_HMAC_SHA1_80".into());
    // 16-byte key + 14-byte salt.
    config.key_base64 = Some("MDEyMzQ1Njc4OWFiY2RlZnNhbHRzYWx0c2FsdHNh".into());

    let handle = start_rtp_encode(config).unwrap();
    assert!(handle.post_pcm(&pcm_bytes(480 * 3)));

    let packets = recv_rtp(&receiver, 3, Duration::from_secs(3));
    assert_eq!(packets.len(), 3);
    for pkt in &packets {
        // Authenticated payload: opus data plus the 10-byte tag.
        assert!(pkt.payload.len() > 10);
        assert_eq!(pkt.header.payload_type, 111);
    }

    handle.stop().unwrap();
}

#[test]
fn decode_pipeline_delivers_pcm_and_conceals_loss() {
    let port = free_port();
    let outputs: Arc<Mutex<Vec<AudioOutput>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&outputs);
    let handle = start_rtp_decode(
        &sdp_for_port(port),
        move |audio| sink.lock().unwrap().push(audio),
        RtpDecodeConfig {
            sample_rate: 24000,
            channels: 1,
        },
    )
    .unwrap();

    // Six consecutive 20 ms frames; two of them (indices 3 and 4) are
    // withheld to simulate loss.
    let mut encoder = Encoder::new(24000, 1, Application::VoIP).unwrap();
    let pcm: Vec<i16> = (0..480).map(|i| ((i * 23) % 6000) as i16).collect();
    let frames: Vec<Vec<u8>> = (0..6)
        .map(|_| {
            let mut buf = vec![0u8; 1500];
            let n = encoder.encode_to(&pcm, 480, &mut buf).unwrap();
            buf.truncate(n);
            buf
        })
        .collect();

    let mut sender =
        RtpSender::open(&format!("rtp://127.0.0.1:{}", port), 7, 111, "peer".into(), None)
            .unwrap();
    for (i, frame) in frames.iter().enumerate() {
        if i == 3 || i == 4 {
            continue;
        }
        sender.write(frame, i as i64 * 960).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    // 4 real frames + 2 recovered ones.
    let deadline = Instant::now() + Duration::from_secs(5);
    while outputs.lock().unwrap().len() < 6 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    let got = outputs.lock().unwrap().clone();
    assert_eq!(got.len(), 6, "expected 6 buffers, got {}", got.len());

    let pts: Vec<i64> = got.iter().map(|o| o.pts.unwrap()).collect();
    assert_eq!(pts, vec![0, 960, 1920, 2880, 3840, 4800]);
    for out in &got {
        assert_eq!(out.buffer.len(), 480); // 20 ms at 24 kHz mono
    }

    let stats = handle.stop().unwrap();
    assert_eq!(stats.packets_decoded, 4);
    assert_eq!(stats.missing_frames_recovered, 2);
    assert!(stats.start_time_local.is_some());
}

#[test]
fn decode_pipeline_stops_promptly() {
    let port = free_port();
    let handle = start_rtp_decode(
        &sdp_for_port(port),
        |_| {},
        RtpDecodeConfig {
            sample_rate: 48000,
            channels: 1,
        },
    )
    .unwrap();

    let started = Instant::now();
    let stats = handle.stop().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        started.elapsed()
    );
    assert_eq!(stats.packets_decoded, 0);
}

mod ogg_stream {
    use super::page_checksum;

    pub fn opus_head(channels: u8) -> Vec<u8> {
        let mut h = vec![0u8; 19];
        h[..8].copy_from_slice(b"OpusHead");
        h[8] = 1;
        h[9] = channels;
        h[10..12].copy_from_slice(&312u16.to_le_bytes());
        h[12..16].copy_from_slice(&48000u32.to_le_bytes());
        h
    }

    pub fn opus_tags() -> Vec<u8> {
        let mut t = Vec::new();
        t.extend_from_slice(b"OpusTags");
        t.extend_from_slice(&8u32.to_le_bytes());
        t.extend_from_slice(b"opuswire");
        t.extend_from_slice(&0u32.to_le_bytes());
        t
    }

    pub fn page(out: &mut Vec<u8>, header_type: u8, granule: i64, sequence: u32, packets: &[&[u8]]) {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for pkt in packets {
            let mut remaining = pkt.len();
            loop {
                if remaining >= 255 {
                    lacing.push(255);
                    remaining -= 255;
                } else {
                    lacing.push(remaining as u8);
                    break;
                }
            }
            body.extend_from_slice(pkt);
        }

        let mut header = [0u8; 27];
        header[..4].copy_from_slice(b"OggS");
        header[5] = header_type;
        header[6..14].copy_from_slice(&granule.to_le_bytes());
        header[14..18].copy_from_slice(&1u32.to_le_bytes());
        header[18..22].copy_from_slice(&sequence.to_le_bytes());
        header[26] = lacing.len() as u8;

        let crc = page_checksum(&header, &lacing, &body);
        header[22..26].copy_from_slice(&crc.to_le_bytes());

        out.extend_from_slice(&header);
        out.extend_from_slice(&lacing);
        out.extend_from_slice(&body);
    }
}

#[test]
fn file_demux_feeds_producer_over_rtp() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = receiver.local_addr().unwrap().port();

    let producer = start_producer(ProducerConfig {
        url: format!("rtp://127.0.0.1:{}", port),
        ssrc: 0xABCD,
        payload_type: 111,
        cname: "tts".into(),
        crypto_suite: None,
        key_base64: None,
    })
    .unwrap();

    let demux = start_file_demux(producer.queue()).unwrap();

    // A synthesized-speech style stream: five 20 ms frames.
    let frames: Vec<Vec<u8>> = (0..5u8).map(|i| vec![0x08, i, i]).collect();
    let refs: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
    let mut stream = Vec::new();
    ogg_stream::page(&mut stream, 0x02, 0, 0, &[&ogg_stream::opus_head(1)]);
    ogg_stream::page(&mut stream, 0, 0, 1, &[&ogg_stream::opus_tags()]);
    ogg_stream::page(&mut stream, 0, 4800, 2, &refs);

    assert!(demux.push_bytes(&stream));

    let packets = recv_rtp(&receiver, 5, Duration::from_secs(3));
    assert_eq!(packets.len(), 5);
    for (i, pkt) in packets.iter().enumerate() {
        assert_eq!(pkt.payload, frames[i]);
    }
    let ts: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
    for pair in ts.windows(2) {
        assert_eq!(pair[1] - pair[0], 960);
    }

    demux.post_end_of_file();
    let demux_stats = demux.stop().unwrap();
    assert_eq!(demux_stats.conditioner.forwarded, 5);

    producer.post_end_of_file();
    let produce_stats = producer.stop().unwrap();
    assert_eq!(produce_stats.packets_written, 5);
}

#[test]
fn producer_accepts_direct_packets_and_drops_regressions() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = receiver.local_addr().unwrap().port();

    let producer = start_producer(ProducerConfig {
        url: format!("rtp://127.0.0.1:{}", port),
        ssrc: 1,
        payload_type: 111,
        cname: "direct".into(),
        crypto_suite: None,
        key_base64: None,
    })
    .unwrap();

    let queue = producer.queue();
    let frame = |pts: i64| ControlMessage::Packet(Packet::new(vec![0x08, 0, 0], pts, 960));

    queue.send(frame(0), true).unwrap();
    queue.send(frame(960), true).unwrap();
    // Forward-moving pts that still lands behind the expectation.
    queue
        .send(
            ControlMessage::Packet(Packet::new(vec![0x08, 1, 1], 1000, 960)),
            true,
        )
        .unwrap();
    queue.send(frame(1920), true).unwrap();

    let packets = recv_rtp(&receiver, 3, Duration::from_secs(3));
    assert_eq!(packets.len(), 3);

    producer.post_end_of_file();
    let stats = producer.stop().unwrap();
    assert_eq!(stats.packets_written, 3);
    assert_eq!(stats.packets_dropped, 1);
}
