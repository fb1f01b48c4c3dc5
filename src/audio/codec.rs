//! Wire format for audio: mono 16-bit little-endian linear PCM, base64 framed.
//!
//! Microphone audio goes out at 16 kHz, synthesized speech comes back at 24 kHz.
//! The format is fixed; there is no negotiation.

use super::AudioError;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::time::Duration;

pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Samples per capture window handed to the encoder
pub const CAPTURE_WINDOW: usize = 4096;

const BYTES_PER_SAMPLE: usize = 2;

/// A block of s16le PCM bytes together with its format.
///
/// Fields are private so a frame cannot change after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<u8>,
    sample_rate_hz: u32,
    channel_count: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<u8>, sample_rate_hz: u32, channel_count: u16) -> Result<Self, AudioError> {
        if sample_rate_hz == 0 || channel_count == 0 {
            return Err(AudioError::Config(format!(
                "Invalid frame format: {}Hz, {} channels",
                sample_rate_hz, channel_count
            )));
        }
        let frame_bytes = BYTES_PER_SAMPLE * channel_count as usize;
        if samples.len() % frame_bytes != 0 {
            return Err(AudioError::MalformedPcm(format!(
                "{} bytes is not a whole number of {}-byte frames",
                samples.len(),
                frame_bytes
            )));
        }
        Ok(Self {
            samples,
            sample_rate_hz,
            channel_count,
        })
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    /// Number of sample frames (one sample per channel)
    pub fn frame_count(&self) -> usize {
        self.samples.len() / (BYTES_PER_SAMPLE * self.channel_count as usize)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate_hz as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Stateless encoder/decoder between f32 samples and the wire representation
pub struct AudioFrameCodec;

impl AudioFrameCodec {
    /// Convert normalized f32 microphone samples into a 16 kHz mono frame
    pub fn encode_samples(samples: &[f32]) -> AudioFrame {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for &sample in samples {
            // Symmetric scaling, clamped so +1.0 does not wrap to i16::MIN
            let value = (sample.clamp(-1.0, 1.0) * 32768.0).clamp(-32768.0, 32767.0) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        AudioFrame {
            samples: bytes,
            sample_rate_hz: INPUT_SAMPLE_RATE,
            channel_count: 1,
        }
    }

    /// Base64 payload for the `data` field of an outbound media message
    pub fn to_wire(frame: &AudioFrame) -> String {
        STANDARD.encode(frame.samples())
    }

    /// Parse an inbound base64 payload into a frame of the given format
    pub fn from_wire(data: &str, sample_rate_hz: u32, channel_count: u16) -> Result<AudioFrame, AudioError> {
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| AudioError::Base64Decode(e.to_string()))?;
        AudioFrame::new(bytes, sample_rate_hz, channel_count)
    }

    /// Decode a frame into normalized f32 samples (interleaved if multichannel)
    pub fn decode_pcm(frame: &AudioFrame) -> Vec<f32> {
        frame
            .samples()
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect()
    }
}
