pub mod capture;
pub mod codec;
pub mod cpal_input;
pub mod cpal_output;
pub mod playback;

use thiserror::Error;

pub use capture::{CaptureOutcome, CaptureProcessor, CaptureStats, MicSource, MicrophoneProvider, WindowCallback};
pub use codec::{AudioFrame, AudioFrameCodec};
pub use cpal_input::{CpalMicrophone, CpalMicrophoneProvider};
pub use cpal_output::{CpalOutput, CpalOutputProvider};
pub use playback::{AudioOutput, OutputProvider, PlaybackScheduler, PlaybackUnit, UnitId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resampling error: {0}")]
    Resampling(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(String),

    #[error("Malformed PCM payload: {0}")]
    MalformedPcm(String),
}
