//! Opus decoder.

use std::ptr;

use super::ffi::{self, OpusDecoder as OpusDecoderHandle};

/// Opus decoder error.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Failed to create decoder.
    #[error("opus: decoder create failed: {0}")]
    CreateFailed(String),
    /// Decoding failed.
    #[error("opus: decode failed: {0}")]
    DecodeFailed(String),
}

/// Opus decoder.
///
/// Supports normal decoding plus the two loss-recovery modes the pipeline
/// uses: packet loss concealment (no input data) and in-band FEC recovery
/// from the packet following a loss.
pub struct Decoder {
    sample_rate: i32,
    channels: i32,
    handle: *mut OpusDecoderHandle,
}

// Safety: the decoder handle is owned by one worker thread at a time.
unsafe impl Send for Decoder {}

impl Drop for Decoder {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { ffi::opus_decoder_destroy(self.handle) };
            self.handle = ptr::null_mut();
        }
    }
}

impl Decoder {
    /// Creates a new Opus decoder.
    ///
    /// `sample_rate` must be one of 8000, 12000, 16000, 24000, or 48000;
    /// `channels` 1 or 2.
    pub fn new(sample_rate: i32, channels: i32) -> Result<Self, DecoderError> {
        let mut error: i32 = 0;
        let handle = unsafe { ffi::opus_decoder_create(sample_rate, channels, &mut error) };

        if handle.is_null() || error != ffi::OPUS_OK {
            return Err(DecoderError::CreateFailed(ffi::error_string(error)));
        }

        Ok(Self {
            sample_rate,
            channels,
            handle,
        })
    }

    /// Returns the sample rate.
    pub fn sample_rate(&self) -> i32 {
        self.sample_rate
    }

    /// Returns the number of channels.
    pub fn channels(&self) -> i32 {
        self.channels
    }

    /// Decodes an Opus packet into `buf` (interleaved s16).
    /// Returns the number of samples decoded per channel.
    pub fn decode_to(&mut self, data: &[u8], buf: &mut [i16]) -> Result<i32, DecoderError> {
        self.decode_inner(Some(data), buf, (buf.len() / self.channels as usize) as i32, 0)
    }

    /// Synthesizes `samples` samples per channel of concealment audio for a
    /// lost packet (PLC).
    pub fn conceal_to(&mut self, buf: &mut [i16], samples: i32) -> Result<i32, DecoderError> {
        self.decode_inner(None, buf, samples, 0)
    }

    /// Recovers the frame preceding `data` from its in-band FEC payload,
    /// producing `samples` samples per channel.
    pub fn recover_to(
        &mut self,
        data: &[u8],
        buf: &mut [i16],
        samples: i32,
    ) -> Result<i32, DecoderError> {
        self.decode_inner(Some(data), buf, samples, 1)
    }

    fn decode_inner(
        &mut self,
        data: Option<&[u8]>,
        buf: &mut [i16],
        frame_size: i32,
        decode_fec: i32,
    ) -> Result<i32, DecoderError> {
        let (data_ptr, data_len) = match data {
            Some(d) if !d.is_empty() => (d.as_ptr(), d.len() as i32),
            _ => (ptr::null(), 0),
        };

        debug_assert!(frame_size as usize * self.channels as usize <= buf.len());

        let n = unsafe {
            ffi::opus_decode(
                self.handle,
                data_ptr,
                data_len,
                buf.as_mut_ptr(),
                frame_size,
                decode_fec,
            )
        };

        if n < 0 {
            return Err(DecoderError::DecodeFailed(ffi::error_string(n)));
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::super::encoder::{Application, Encoder};
    use super::super::OPUS_MAX_FRAME_SIZE;
    use super::*;

    #[test]
    fn test_decoder_create() {
        let dec = Decoder::new(16000, 1).unwrap();
        assert_eq!(dec.sample_rate(), 16000);
        assert_eq!(dec.channels(), 1);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = Encoder::new(16000, 1, Application::VoIP).unwrap();
        let mut decoder = Decoder::new(16000, 1).unwrap();

        let pcm: Vec<i16> = (0..320).map(|i| (i * 100 % 32768) as i16).collect();
        let mut packet = vec![0u8; 1500];
        let len = encoder.encode_to(&pcm, 320, &mut packet).unwrap();

        let mut out = vec![0i16; OPUS_MAX_FRAME_SIZE];
        let n = decoder.decode_to(&packet[..len], &mut out).unwrap();
        assert_eq!(n, 320);
    }

    #[test]
    fn test_conceal_produces_requested_samples() {
        let mut encoder = Encoder::new(24000, 1, Application::VoIP).unwrap();
        let mut decoder = Decoder::new(24000, 1).unwrap();

        // Prime the decoder with one real frame so PLC has state to work from.
        let pcm = vec![0i16; 480];
        let mut packet = vec![0u8; 1500];
        let len = encoder.encode_to(&pcm, 480, &mut packet).unwrap();
        let mut out = vec![0i16; OPUS_MAX_FRAME_SIZE];
        decoder.decode_to(&packet[..len], &mut out).unwrap();

        let n = decoder.conceal_to(&mut out, 480).unwrap();
        assert_eq!(n, 480);
    }

    #[test]
    fn test_recover_produces_requested_samples() {
        let mut encoder = Encoder::new(24000, 1, Application::VoIP).unwrap();
        encoder.set_inband_fec(true).unwrap();
        encoder.set_packet_loss_perc(20).unwrap();
        let mut decoder = Decoder::new(24000, 1).unwrap();

        let pcm: Vec<i16> = (0..480).map(|i| ((i * 37) % 2000) as i16).collect();
        let mut packet = vec![0u8; 1500];

        // A couple of frames so the second can carry redundancy.
        let len = encoder.encode_to(&pcm, 480, &mut packet).unwrap();
        let mut out = vec![0i16; OPUS_MAX_FRAME_SIZE];
        decoder.decode_to(&packet[..len], &mut out).unwrap();

        let len = encoder.encode_to(&pcm, 480, &mut packet).unwrap();
        let n = decoder.recover_to(&packet[..len], &mut out, 480).unwrap();
        assert_eq!(n, 480);
    }
}
