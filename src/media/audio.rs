//! PCM audio format descriptor

use serde::{Deserialize, Serialize};

/// Raw PCM layout of the audio chunks published by the microphone
/// collaborator. Only used to describe the payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample (signed little-endian)
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    /// MIME type of a single audio part
    pub fn mime_type(&self) -> String {
        format!(
            "audio/pcm;rate={};channels={};bits={}",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }

    /// Bytes per second of audio
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }
}
