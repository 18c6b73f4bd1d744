//! Audio math and codec helpers.
//!
//! Duration bookkeeping for base64 frames, G.711 expansion for the listener
//! stream (which always carries 16-bit linear PCM), and the process-wide
//! cache of pre-recorded sounds.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::warn;

use crate::storage::ObjectStore;
use crate::types::AudioFormat;

/// Duration in milliseconds of a raw frame in the given call format.
pub fn audio_ms(byte_len: usize, format: AudioFormat) -> u64 {
    let bytes_per_second = (format.sample_rate() * format.bytes_per_sample()) as u64;
    (byte_len as u64 * 1000) / bytes_per_second
}

/// Duration in milliseconds of a base64 frame. Malformed payloads count as
/// zero-length; the frame is still forwarded as-is.
pub fn b64_audio_ms(payload: &str, format: AudioFormat) -> u64 {
    match BASE64.decode(payload) {
        Ok(bytes) => audio_ms(bytes.len(), format),
        Err(e) => {
            warn!("Undecodable audio frame ({e}), counting as 0ms");
            0
        }
    }
}

/// Duration of raw 16-bit PCM at an arbitrary sample rate (used for cached
/// sounds, which are stored as PCM16 regardless of the call codec).
pub fn pcm16_ms(byte_len: usize, sample_rate: u32) -> u64 {
    (byte_len as u64 / 2) * 1000 / sample_rate as u64
}

/// Expand one μ-law byte to a linear PCM16 sample (ITU-T G.711).
pub fn ulaw_expand(byte: u8) -> i16 {
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Expand one A-law byte to a linear PCM16 sample (ITU-T G.711).
pub fn alaw_expand(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let exponent = (a >> 4) & 0x07;
    let mantissa = (a & 0x0F) as i32;
    let magnitude = match exponent {
        0 => (mantissa << 4) + 8,
        _ => ((mantissa << 4) + 0x108) << (exponent - 1),
    };
    // In A-law a set sign bit marks a positive sample.
    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Transcode a raw frame to little-endian PCM16. PCM16 input passes through.
pub fn to_pcm16(bytes: &[u8], format: AudioFormat) -> Vec<u8> {
    let expand: fn(u8) -> i16 = match format {
        AudioFormat::Pcm16 => return bytes.to_vec(),
        AudioFormat::G711Ulaw => ulaw_expand,
        AudioFormat::G711Alaw => alaw_expand,
    };
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.extend_from_slice(&expand(b).to_le_bytes());
    }
    out
}

/// A cached pre-recorded sound, base64-encoded with its play duration.
#[derive(Debug, Clone)]
pub struct Sound {
    pub payload_b64: String,
    pub duration_ms: u64,
}

/// Process-wide cache of sounds downloaded from object storage at startup.
///
/// Sounds are raw PCM16 at the sample rate named by their suffix; a missing
/// sound is logged and the feature that needs it degrades (the browser
/// hang-up simply plays no tone).
#[derive(Debug, Default)]
pub struct SoundCache {
    sounds: HashMap<String, Sound>,
}

impl SoundCache {
    pub const HANG_UP_TONE_24K: &'static str = "hang_up_tone_24k";
    pub const HANG_UP_TONE_8K: &'static str = "hang_up_tone_8k";

    pub async fn load(storage: &ObjectStore, prefix: &str) -> Self {
        let mut sounds = HashMap::new();
        for name in [Self::HANG_UP_TONE_24K, Self::HANG_UP_TONE_8K] {
            let sample_rate = if name.ends_with("_8k") { 8_000 } else { 24_000 };
            let path = format!("{prefix}/{name}.pcm");
            match storage.download(&path).await {
                Ok(bytes) => {
                    let duration_ms = pcm16_ms(bytes.len(), sample_rate);
                    sounds.insert(
                        name.to_string(),
                        Sound {
                            payload_b64: BASE64.encode(&bytes),
                            duration_ms,
                        },
                    );
                }
                Err(e) => warn!("Sound {name} unavailable: {e}"),
            }
        }
        Self { sounds }
    }

    pub fn get(&self, name: &str) -> Option<&Sound> {
        self.sounds.get(name)
    }

    #[cfg(test)]
    pub fn with_sound(name: &str, sound: Sound) -> Self {
        let mut sounds = HashMap::new();
        sounds.insert(name.to_string(), sound);
        Self { sounds }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_ms_per_codec() {
        // 1 second of μ-law at 8kHz is 8000 bytes
        assert_eq!(audio_ms(8_000, AudioFormat::G711Ulaw), 1_000);
        // 1 second of PCM16 at 24kHz is 48000 bytes
        assert_eq!(audio_ms(48_000, AudioFormat::Pcm16), 1_000);
        // 160-byte telephony frame = 20ms
        assert_eq!(audio_ms(160, AudioFormat::G711Ulaw), 20);
    }

    #[test]
    fn test_b64_audio_ms_round_trip() {
        let frame = vec![0u8; 160];
        let encoded = BASE64.encode(&frame);
        assert_eq!(b64_audio_ms(&encoded, AudioFormat::G711Ulaw), 20);
        assert_eq!(b64_audio_ms("not base64!!!", AudioFormat::G711Ulaw), 0);
    }

    #[test]
    fn test_ulaw_endpoints() {
        // Canonical G.711 values: 0xFF/0x7F are zero, 0x80/0x00 are the extremes
        assert_eq!(ulaw_expand(0xFF), 0);
        assert_eq!(ulaw_expand(0x7F), 0);
        assert_eq!(ulaw_expand(0x80), 32_124);
        assert_eq!(ulaw_expand(0x00), -32_124);
    }

    #[test]
    fn test_alaw_endpoints() {
        assert_eq!(alaw_expand(0xD5), 8);
        assert_eq!(alaw_expand(0x55), -8);
        assert_eq!(alaw_expand(0xAA), 32_256);
        assert_eq!(alaw_expand(0x2A), -32_256);
    }

    #[test]
    fn test_to_pcm16_doubles_ulaw() {
        let data = vec![0xFFu8, 0x80];
        let pcm = to_pcm16(&data, AudioFormat::G711Ulaw);
        assert_eq!(pcm.len(), 4);
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), 0);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), 32_124);
    }

    #[test]
    fn test_to_pcm16_passthrough() {
        let data = vec![1u8, 2, 3, 4];
        assert_eq!(to_pcm16(&data, AudioFormat::Pcm16), data);
    }

    #[test]
    fn test_pcm16_ms() {
        assert_eq!(pcm16_ms(48_000, 24_000), 1_000);
        assert_eq!(pcm16_ms(16_000, 8_000), 1_000);
    }

    #[test]
    fn test_sound_cache_lookup() {
        let cache = SoundCache::with_sound(
            SoundCache::HANG_UP_TONE_24K,
            Sound {
                payload_b64: "AAAA".to_string(),
                duration_ms: 10,
            },
        );
        assert!(cache.get(SoundCache::HANG_UP_TONE_24K).is_some());
        assert!(cache.get(SoundCache::HANG_UP_TONE_8K).is_none());
    }
}
