//! # Audio Frames
//!
//! An [`AudioFrame`] is the unit of audio that moves through the relay: a block of
//! samples tagged with the sample rate, channel count and encoding it was produced in.
//!
//! ## Supported Encodings:
//! - **Linear16**: signed 16-bit little-endian PCM (2 bytes per sample)
//! - **Mulaw8**: G.711 mu-law companded samples (1 byte per sample)
//!
//! ## Invariant:
//! The byte length of a frame is always a whole number of samples for its encoding
//! and channel count. The constructor enforces this, so every other part of the relay
//! can slice frames without re-checking.

use crate::audio::codec;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// The sample encoding carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// 16-bit signed little-endian linear PCM
    Linear16,
    /// 8-bit mu-law companded samples
    Mulaw8,
}

impl AudioEncoding {
    /// Number of bytes used by a single sample of one channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioEncoding::Linear16 => 2,
            AudioEncoding::Mulaw8 => 1,
        }
    }

    /// The byte value that represents a zero-amplitude sample.
    ///
    /// Mu-law silence is `0xFF`, not `0x00` (which decodes to the most negative value).
    pub fn silence_byte(self) -> u8 {
        match self {
            AudioEncoding::Linear16 => 0x00,
            AudioEncoding::Mulaw8 => 0xFF,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AudioEncoding::Linear16 => "linear16",
            AudioEncoding::Mulaw8 => "mulaw8",
        }
    }
}

/// Errors raised when building a frame with an impossible shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {len} is not a multiple of {block} bytes ({encoding} x {channels} channel(s))")]
    PartialSample {
        len: usize,
        block: usize,
        encoding: &'static str,
        channels: u16,
    },

    #[error("sample rate must be greater than 0")]
    ZeroSampleRate,

    #[error("channel count must be greater than 0")]
    ZeroChannels,
}

/// An immutable block of audio samples.
///
/// ## Rust Concepts:
/// - **Private fields + constructor**: the only way to get an `AudioFrame` is through
///   [`AudioFrame::new`], which validates the shape. Fields are read through accessors.
/// - **Clone**: frames are cloned when silence is substituted or a frame is fanned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    encoding: AudioEncoding,
}

impl AudioFrame {
    /// Create a frame, checking that `data` holds whole samples for every channel.
    pub fn new(
        data: Vec<u8>,
        sample_rate: u32,
        channels: u16,
        encoding: AudioEncoding,
    ) -> Result<Self, FrameError> {
        if sample_rate == 0 {
            return Err(FrameError::ZeroSampleRate);
        }
        if channels == 0 {
            return Err(FrameError::ZeroChannels);
        }

        let block = encoding.bytes_per_sample() * channels as usize;
        if data.len() % block != 0 {
            return Err(FrameError::PartialSample {
                len: data.len(),
                block,
                encoding: encoding.as_str(),
                channels,
            });
        }

        Ok(Self {
            data,
            sample_rate,
            channels,
            encoding,
        })
    }

    /// Build a Linear16 frame from interleaved samples.
    ///
    /// The sample count must be a multiple of `channels`.
    pub fn from_pcm16(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Self, FrameError> {
        let mut data = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut data);
        Self::new(data, sample_rate, channels, AudioEncoding::Linear16)
    }

    /// Build a frame of `samples_per_channel` zero-valued samples.
    pub fn silence(
        samples_per_channel: usize,
        sample_rate: u32,
        channels: u16,
        encoding: AudioEncoding,
    ) -> Result<Self, FrameError> {
        let len = samples_per_channel * channels as usize * encoding.bytes_per_sample();
        Self::new(vec![encoding.silence_byte(); len], sample_rate, channels, encoding)
    }

    /// A zero-valued frame with exactly the same shape as `self`.
    ///
    /// Used wherever audio must be replaced rather than omitted so that the real-time
    /// cadence of the stream is preserved.
    pub fn silence_like(&self) -> Self {
        Self {
            data: vec![self.encoding.silence_byte(); self.data.len()],
            sample_rate: self.sample_rate,
            channels: self.channels,
            encoding: self.encoding,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of samples per channel.
    pub fn sample_count(&self) -> usize {
        self.data.len() / (self.encoding.bytes_per_sample() * self.channels as usize)
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.sample_count() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Interleaved samples as 16-bit linear PCM, decoding mu-law if necessary.
    pub fn pcm16_samples(&self) -> Vec<i16> {
        match self.encoding {
            AudioEncoding::Linear16 => {
                let mut samples = vec![0i16; self.data.len() / 2];
                LittleEndian::read_i16_into(&self.data, &mut samples);
                samples
            }
            AudioEncoding::Mulaw8 => codec::decode_companded(&self.data),
        }
    }

    /// Convert to Linear16 at `target_rate`.
    ///
    /// ## Conversion Order:
    /// Companding is expanded first and the result is resampled afterwards. Doing it the
    /// other way round would interpolate between logarithmic codes and distort the signal.
    pub fn to_linear16(&self, target_rate: u32) -> Result<Self, FrameError> {
        if self.encoding == AudioEncoding::Linear16 && self.sample_rate == target_rate {
            return Ok(self.clone());
        }

        let linear = self.pcm16_samples();
        let resampled = codec::resample(&linear, self.channels, self.sample_rate, target_rate);
        Self::from_pcm16(&resampled, target_rate, self.channels)
    }

    /// Convert to Mulaw8 at `target_rate`.
    ///
    /// ## Conversion Order:
    /// Resampling happens on linear samples first, then the result is companded.
    pub fn to_mulaw8(&self, target_rate: u32) -> Result<Self, FrameError> {
        if self.encoding == AudioEncoding::Mulaw8 && self.sample_rate == target_rate {
            return Ok(self.clone());
        }

        let linear = self.pcm16_samples();
        let resampled = codec::resample(&linear, self.channels, self.sample_rate, target_rate);
        Self::new(
            codec::encode_companded(&resampled),
            target_rate,
            self.channels,
            AudioEncoding::Mulaw8,
        )
    }
}
