//! Gapless scheduling of synthesized speech against the output clock.

use super::codec::{AudioFrame, AudioFrameCodec, OUTPUT_SAMPLE_RATE};
use super::AudioError;
use std::collections::HashMap;
use std::sync::Arc;

pub type UnitId = u64;

/// A decoded chunk of speech with its slot on the output clock
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    buffer: Arc<[f32]>,
    sample_rate_hz: u32,
    scheduled_start: f64,
    playback_rate: f32,
}

impl PlaybackUnit {
    pub fn new(buffer: Vec<f32>, sample_rate_hz: u32, scheduled_start: f64, playback_rate: f32) -> Self {
        Self {
            buffer: buffer.into(),
            sample_rate_hz,
            scheduled_start,
            playback_rate,
        }
    }

    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Cheap handle to the decoded samples for output backends
    pub fn shared_buffer(&self) -> Arc<[f32]> {
        Arc::clone(&self.buffer)
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn scheduled_start(&self) -> f64 {
        self.scheduled_start
    }

    pub fn playback_rate(&self) -> f32 {
        self.playback_rate
    }

    /// Length of the buffer at its natural rate, in seconds
    pub fn duration(&self) -> f64 {
        self.buffer.len() as f64 / self.sample_rate_hz as f64
    }

    /// Output-clock time at which the unit finishes
    pub fn end_time(&self) -> f64 {
        self.scheduled_start + self.duration() / self.playback_rate as f64
    }
}

/// Platform audio output the scheduler drives.
///
/// Implementations must not block: `start` and `stop` are called from the
/// session's receive loop.
pub trait AudioOutput: Send + Sync {
    /// Monotonic output clock, in seconds
    fn current_time(&self) -> f64;

    /// Begin playing `unit` at its scheduled start time
    fn start(&self, id: UnitId, unit: &PlaybackUnit);

    /// Halt a unit immediately. Unknown or already finished ids are ignored.
    fn stop(&self, id: UnitId);
}

/// Opens an output device for one connection attempt
pub trait OutputProvider: Send + Sync {
    fn open(&self) -> Result<Arc<dyn AudioOutput>, AudioError>;
}

pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    next_start_time: f64,
    // id -> end time on the output clock
    active: HashMap<UnitId, f64>,
    next_id: UnitId,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let next_start_time = output.current_time();
        Self {
            output,
            next_start_time,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Decode a base64 speech chunk and schedule it right after the previous one.
    pub fn enqueue(&mut self, chunk: &str, playback_rate: f32) -> Result<UnitId, AudioError> {
        let frame = AudioFrameCodec::from_wire(chunk, OUTPUT_SAMPLE_RATE, 1)?;
        self.enqueue_frame(&frame, playback_rate)
    }

    pub fn enqueue_frame(&mut self, frame: &AudioFrame, playback_rate: f32) -> Result<UnitId, AudioError> {
        if !playback_rate.is_finite() || playback_rate <= 0.0 {
            return Err(AudioError::Config(format!(
                "Invalid playback rate: {}",
                playback_rate
            )));
        }
        if frame.is_empty() {
            return Err(AudioError::MalformedPcm("empty audio chunk".to_string()));
        }

        let now = self.output.current_time();
        self.reap(now);

        // Contiguous arrivals land exactly on the previous end; late ones start now.
        let start = self.next_start_time.max(now);
        let unit = PlaybackUnit::new(
            AudioFrameCodec::decode_pcm(frame),
            frame.sample_rate_hz(),
            start,
            playback_rate,
        );

        let id = self.next_id;
        self.next_id += 1;

        self.output.start(id, &unit);
        self.next_start_time = unit.end_time();
        self.active.insert(id, self.next_start_time);

        log::debug!(
            "🔊 Scheduled unit {} at {:.3}s ({:.3}s @ {}x, {} pending)",
            id,
            start,
            unit.duration(),
            playback_rate,
            self.active.len()
        );
        Ok(id)
    }

    /// Barge-in: halt everything scheduled or playing and forget it.
    /// Calling this with nothing playing is a no-op apart from the reset.
    pub fn stop_all(&mut self) {
        if !self.active.is_empty() {
            log::debug!("🔇 Stopping {} playback units", self.active.len());
        }
        for (id, _) in self.active.drain() {
            self.output.stop(id);
        }
        self.next_start_time = 0.0;
    }

    /// Drop units that have finished playing by `now`
    fn reap(&mut self, now: f64) {
        self.active.retain(|_, end| *end > now);
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Units scheduled or playing, as of the last enqueue
    pub fn pending_count(&self) -> usize {
        self.active.len()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
