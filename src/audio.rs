//! Audio format constants and the PCM16 codec.
//!
//! The wire sample format is little-endian signed 16-bit PCM, text-encoded
//! as base64 for transport inside JSON envelopes. Capture runs at 16 kHz
//! mono; server audio plays back at 24 kHz mono.

use crate::error::{Result, VoiceError};
use base64::Engine;
use bytes::Bytes;
use std::time::Duration;

/// Microphone capture sample rate in Hz.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Server audio playback sample rate in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Mono throughout the pipeline.
pub const CHANNELS: u16 = 1;

/// Samples per capture block, which fixes the frame callback cadence
/// (4096 samples at 16 kHz is 256 ms per frame).
pub const BLOCK_SIZE: usize = 4096;

/// Mime type declared on outbound audio chunks.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Convert float samples in [-1, 1] to little-endian PCM16 bytes.
///
/// Negative samples scale by 32768 and non-negative by 32767 so neither
/// direction can overflow the i16 range. The asymmetry is intentional and
/// kept bit-compatible with what the remote service has been receiving.
pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 { (s * 32768.0) as i16 } else { (s * 32767.0) as i16 };
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Convert little-endian PCM16 bytes back to float samples.
///
/// Fails with [`VoiceError::Decode`] when the byte count is odd.
pub fn f32_from_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        samples.push(f32::from(value) / 32768.0);
    }
    Ok(samples)
}

/// Encode one captured frame as base64 PCM16 for the wire.
pub fn encode_frame(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16_from_f32(samples))
}

/// Decode a base64-encoded PCM16 payload into raw bytes.
///
/// Fails with [`VoiceError::Decode`] on malformed base64.
pub fn decode_base64(encoded: &str) -> Result<Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| VoiceError::decode(format!("invalid base64 audio payload: {e}")))
}

/// Intrinsic duration of `sample_count` mono samples at `sample_rate`.
pub fn duration_of(sample_count: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(sample_count as f64 / f64::from(sample_rate))
}
