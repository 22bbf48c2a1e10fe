//! Opus encoder.

use std::ptr;

use super::ffi::{self, OpusEncoder as OpusEncoderHandle};

/// Opus application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Application {
    /// Best quality for voice signals.
    VoIP,
    /// Best quality for non-voice signals.
    Audio,
    /// Minimum possible coding delay.
    RestrictedLowdelay,
}

impl Application {
    fn to_ffi(self) -> i32 {
        match self {
            Self::VoIP => ffi::OPUS_APPLICATION_VOIP,
            Self::Audio => ffi::OPUS_APPLICATION_AUDIO,
            Self::RestrictedLowdelay => ffi::OPUS_APPLICATION_RESTRICTED_LOWDELAY,
        }
    }
}

/// Opus encoder error.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// Failed to create encoder.
    #[error("opus: encoder create failed: {0}")]
    CreateFailed(String),
    /// Encoding failed.
    #[error("opus: encode failed: {0}")]
    EncodeFailed(String),
    /// Failed to set option.
    #[error("opus: set option failed: {0}")]
    SetOptionFailed(String),
}

/// Opus encoder.
pub struct Encoder {
    sample_rate: i32,
    channels: i32,
    handle: *mut OpusEncoderHandle,
}

// Safety: the encoder handle is owned by one worker thread at a time.
unsafe impl Send for Encoder {}

impl Drop for Encoder {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { ffi::opus_encoder_destroy(self.handle) };
            self.handle = ptr::null_mut();
        }
    }
}

impl Encoder {
    /// Creates a new Opus encoder.
    ///
    /// `sample_rate` must be one of 8000, 12000, 16000, 24000, or 48000;
    /// `channels` 1 or 2.
    pub fn new(
        sample_rate: i32,
        channels: i32,
        application: Application,
    ) -> Result<Self, EncoderError> {
        let mut error: i32 = 0;
        let handle = unsafe {
            ffi::opus_encoder_create(sample_rate, channels, application.to_ffi(), &mut error)
        };

        if handle.is_null() || error != ffi::OPUS_OK {
            return Err(EncoderError::CreateFailed(ffi::error_string(error)));
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

    /// Encodes `frame_size` samples per channel from `pcm` into `buf`.
    /// Returns the encoded packet length in bytes.
    pub fn encode_to(
        &mut self,
        pcm: &[i16],
        frame_size: i32,
        buf: &mut [u8],
    ) -> Result<usize, EncoderError> {
        debug_assert!(pcm.len() >= (frame_size * self.channels) as usize);

        let n = unsafe {
            ffi::opus_encode(
                self.handle,
                pcm.as_ptr(),
                frame_size,
                buf.as_mut_ptr(),
                buf.len() as i32,
            )
        };

        if n < 0 {
            return Err(EncoderError::EncodeFailed(ffi::error_string(n)));
        }

        Ok(n as usize)
    }

    /// Sets the target bitrate in bits per second. Values <= 0 select the
    /// automatic bitrate.
    pub fn set_bitrate(&mut self, bitrate: i32) -> Result<(), EncoderError> {
        let value = if bitrate > 0 { bitrate } else { ffi::OPUS_AUTO };
        self.ctl(ffi::OPUS_SET_BITRATE_REQUEST, value)
    }

    /// Enables or disables in-band forward error correction.
    pub fn set_inband_fec(&mut self, enable: bool) -> Result<(), EncoderError> {
        self.ctl(ffi::OPUS_SET_INBAND_FEC_REQUEST, enable as i32)
    }

    /// Sets the expected packet loss percentage (0-100).
    pub fn set_packet_loss_perc(&mut self, percent: i32) -> Result<(), EncoderError> {
        self.ctl(ffi::OPUS_SET_PACKET_LOSS_PERC_REQUEST, percent)
    }

    fn ctl(&mut self, request: i32, value: i32) -> Result<(), EncoderError> {
        let ret = unsafe { ffi::opus_encoder_ctl(self.handle, request, value) };
        if ret != ffi::OPUS_OK {
            return Err(EncoderError::SetOptionFailed(ffi::error_string(ret)));
        }
        Ok(())
    }

    /// Returns the samples-per-channel count of a 20 ms frame at this
    /// encoder's sample rate.
    pub fn frame_size_20ms(&self) -> i32 {
        self.sample_rate * 20 / 1000
    }
}
