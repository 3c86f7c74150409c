//! PCM16 wire codec.
//!
//! Outbound audio is f32 in \[-1, 1\] scaled to 16-bit signed little-endian
//! PCM and base64 encoded. Inbound audio reverses those steps. Scaling
//! truncates toward zero and saturates at the i16 bounds, so +1.0 becomes
//! 32767 rather than wrapping. Decoding is strict: there is no recovery from
//! a malformed payload.

use crate::audio::frame::AudioFrame;
use crate::error::{Result, VoiceError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Full-scale divisor between i16 PCM and f32 samples.
const PCM16_SCALE: f32 = 32768.0;

/// Encode f32 samples as base64 PCM16LE.
pub fn encode_outbound(samples: &[f32]) -> String {
    STANDARD.encode(f32_to_pcm16(samples))
}

/// Decode a base64 PCM16LE payload into an [`AudioFrame`].
///
/// # Errors
///
/// Returns [`VoiceError::Decode`] on malformed base64, an odd byte count, a
/// zero channel count, or a sample count that does not divide evenly into
/// `channels`.
pub fn decode_inbound(payload: &str, sample_rate: u32, channels: u16) -> Result<AudioFrame> {
    if channels == 0 {
        return Err(VoiceError::Decode("channel count must be at least 1".into()));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| VoiceError::Decode(format!("invalid base64: {e}")))?;
    let samples = pcm16_to_f32(&bytes)?;
    if samples.len() % channels as usize != 0 {
        return Err(VoiceError::Decode(format!(
            "{} samples do not divide into {channels} channels",
            samples.len()
        )));
    }
    Ok(AudioFrame::new(samples, sample_rate, channels))
}

/// Convert f32 samples to PCM16LE bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // `as` truncates toward zero and saturates out-of-range values.
        let value = (sample * PCM16_SCALE) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert PCM16LE bytes to f32 samples.
///
/// # Errors
///
/// Returns [`VoiceError::Decode`] if `bytes` has an odd length.
pub fn pcm16_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "odd PCM16 byte length: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM16_SCALE)
        .collect())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn round_trip_within_one_quantization_step() {
        let samples: Vec<f32> = (0..=200).map(|i| -1.0 + i as f32 * 0.01).collect();
        let encoded = encode_outbound(&samples);
        let frame = decode_inbound(&encoded, 16_000, 1).expect("decode");

        assert_eq!(frame.samples().len(), samples.len());
        for (original, decoded) in samples.iter().zip(frame.samples()) {
            assert!(
                (original - decoded).abs() <= 1.0 / 32768.0 + f32::EPSILON,
                "{original} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn scaling_truncates_and_saturates() {
        let bytes = f32_to_pcm16(&[1.0, -1.0, 0.5, 0.00002, -0.00002]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![32767, -32768, 16384, 0, 0]);
    }

    #[test]
    fn packs_little_endian() {
        // 0.25 * 32768 = 8192 = 0x2000
        assert_eq!(f32_to_pcm16(&[0.25]), vec![0x00, 0x20]);
    }

    #[test]
    fn decode_stereo_deinterleaves() {
        let encoded = encode_outbound(&[0.5, -0.5, 0.25, -0.25]);
        let frame = decode_inbound(&encoded, 24_000, 2).expect("decode");
        assert_eq!(frame.frame_count(), 2);
        assert_eq!(frame.channel(0), vec![0.5, 0.25]);
        assert_eq!(frame.channel(1), vec![-0.5, -0.25]);
    }

    #[test]
    fn malformed_base64_is_an_error() {
        let err = decode_inbound("not base64!!", 24_000, 1).unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
    }

    #[test]
    fn odd_byte_length_is_an_error() {
        let payload = STANDARD.encode([0u8, 1, 2]);
        let err = decode_inbound(&payload, 24_000, 1).unwrap_err();
        assert!(err.to_string().contains("odd"));
    }

    #[test]
    fn uneven_channel_split_is_an_error() {
        let payload = encode_outbound(&[0.1, 0.2, 0.3]);
        assert!(decode_inbound(&payload, 24_000, 2).is_err());
        assert!(decode_inbound(&payload, 24_000, 0).is_err());
    }

    #[test]
    fn empty_payload_decodes_to_empty_frame() {
        let frame = decode_inbound("", 24_000, 1).expect("decode");
        assert!(frame.is_empty());
        assert_eq!(frame.duration(), 0.0);
    }
}
