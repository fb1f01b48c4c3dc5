use super::codec::AudioFrameCodec;
use super::AudioError;
use crate::protocol::ClientMessage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Callback invoked on the audio thread with one window of mono f32 samples
pub type WindowCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A push source of microphone audio.
///
/// Windows are delivered as normalized mono f32 at 16 kHz on the device's own
/// cadence. Dropping the source releases the device.
pub trait MicSource: Send {
    fn start(&mut self, on_window: WindowCallback) -> Result<(), AudioError>;

    fn stop(&mut self);
}

/// Acquires the microphone for one connection attempt.
///
/// An error here is treated as fatal by the session (permission denied, no
/// device, unsupported format).
pub trait MicrophoneProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn MicSource>, AudioError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Sent,
    Muted,
    /// Outbound channel was full or closed; the frame is gone
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_sent: u64,
    pub dropped_muted: u64,
    pub dropped_backpressure: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    muted: AtomicU64,
    dropped: AtomicU64,
}

/// Encodes microphone windows and forwards them to the connection.
///
/// Frames are never queued locally: when the outbound channel is saturated the
/// newest frame is dropped so latency cannot grow. Frames captured while muted
/// are discarded, so unmuting does not flush a backlog.
#[derive(Clone)]
pub struct CaptureProcessor {
    muted: Arc<AtomicBool>,
    outbound: mpsc::Sender<ClientMessage>,
    counters: Arc<Counters>,
}

impl CaptureProcessor {
    pub fn new(muted: Arc<AtomicBool>, outbound: mpsc::Sender<ClientMessage>) -> Self {
        Self {
            muted,
            outbound,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start `mic` and route every window it produces through this processor
    pub fn attach(&self, mic: &mut dyn MicSource) -> Result<(), AudioError> {
        let processor = self.clone();
        mic.start(Box::new(move |window: &[f32]| {
            processor.process_window(window);
        }))
    }

    /// Handle one capture window. Never blocks.
    pub fn process_window(&self, samples: &[f32]) -> CaptureOutcome {
        if self.muted.load(Ordering::Acquire) {
            self.counters.muted.fetch_add(1, Ordering::Relaxed);
            return CaptureOutcome::Muted;
        }

        let frame = AudioFrameCodec::encode_samples(samples);
        match self.outbound.try_send(ClientMessage::audio(&frame)) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                CaptureOutcome::Sent
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::trace!("🎤 Outbound channel full, dropped frame ({} total)", dropped);
                CaptureOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                CaptureOutcome::Dropped
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            dropped_muted: self.counters.muted.load(Ordering::Relaxed),
            dropped_backpressure: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
