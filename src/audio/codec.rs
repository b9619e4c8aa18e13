//! # Codec Conversion
//!
//! Stateless conversions between the telephony representation of audio
//! (8-bit mu-law at a narrowband rate) and the linear PCM the voice session consumes.
//!
//! ## Key Functions:
//! - **decode_companded**: mu-law bytes → 16-bit linear samples (one-to-one)
//! - **encode_companded**: 16-bit linear samples → mu-law bytes (one-to-one)
//! - **resample**: change the sample rate of interleaved 16-bit samples
//!
//! ## Failure Model:
//! None of these functions can fail. Empty input produces empty output, so a malformed
//! or zero-length payload never turns into an error further up the pipeline.

/// Bias added to magnitudes before companding (G.711).
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude that can be represented before the bias would overflow the top segment.
const MULAW_CLIP: i32 = 32635;

/// Expansion table for every possible mu-law byte, built at compile time.
static MULAW_DECODE_TABLE: [i16; 256] = build_decode_table();

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        let byte = !(i as u8);
        let exponent = ((byte >> 4) & 0x07) as i32;
        let mantissa = (byte & 0x0F) as i32;
        let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
        table[i] = if byte & 0x80 != 0 {
            -magnitude as i16
        } else {
            magnitude as i16
        };
        i += 1;
    }
    table
}

/// Expand mu-law bytes into 16-bit linear samples.
///
/// Each input byte produces exactly one output sample, so the output holds
/// `bytes.len()` samples (twice as many bytes once serialized).
pub fn decode_companded(bytes: &[u8]) -> Vec<i16> {
    bytes
        .iter()
        .map(|&b| MULAW_DECODE_TABLE[b as usize])
        .collect()
}

/// Compress 16-bit linear samples into mu-law bytes.
///
/// ## Quantization:
/// The encoder truncates into 16 steps per segment; decoding returns the middle of the
/// step, so the round-trip error of a sample is at most half the step size of its segment
/// (512 in the loudest segment), plus clipping above ±32635.
pub fn encode_companded(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

fn encode_sample(sample: i16) -> u8 {
    // Work in i32 so that i16::MIN can be negated
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80u8
    } else {
        0x00u8
    };

    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    // magnitude >> 7 is in 1..=255 here, its highest set bit is the segment number
    let exponent = 31 - ((magnitude >> 7) as u32).leading_zeros();
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Resample interleaved 16-bit samples from `from_rate_hz` to `to_rate_hz`.
///
/// ## Algorithm:
/// Linear interpolation per channel. It is not bit-exact, but it keeps the waveform shape
/// within the usual interpolation error for speech-band signals, and it needs no state
/// between calls so every frame can be converted independently.
///
/// ## Guarantees:
/// - Equal rates return the input unchanged (a copy, not an approximation)
/// - The number of frames changes in proportion to the rate ratio (rounded up)
/// - Empty input, zero rates or zero channels return an empty or unchanged buffer
pub fn resample(samples: &[i16], channels: u16, from_rate_hz: u32, to_rate_hz: u32) -> Vec<i16> {
    if from_rate_hz == to_rate_hz || samples.is_empty() {
        return samples.to_vec();
    }
    if channels == 0 || from_rate_hz == 0 || to_rate_hz == 0 {
        return Vec::new();
    }

    let channels = channels as usize;
    let frames_in = samples.len() / channels;
    if frames_in == 0 {
        return Vec::new();
    }

    let frames_out = ((frames_in as u64 * to_rate_hz as u64 + from_rate_hz as u64 - 1)
        / from_rate_hz as u64) as usize;
    let step = from_rate_hz as f64 / to_rate_hz as f64;

    let mut output = Vec::with_capacity(frames_out * channels);
    for i in 0..frames_out {
        let src_pos = i as f64 * step;
        let src_idx = src_pos as usize;
        let frac = src_pos - src_idx as f64;

        for ch in 0..channels {
            let value = if src_idx + 1 < frames_in {
                let a = samples[src_idx * channels + ch] as f64;
                let b = samples[(src_idx + 1) * channels + ch] as f64;
                a * (1.0 - frac) + b * frac
            } else {
                samples[(frames_in - 1) * channels + ch] as f64
            };
            output.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        }
    }

    output
}
