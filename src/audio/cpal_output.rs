use super::playback::{AudioOutput, OutputProvider, PlaybackUnit, UnitId};
use super::AudioError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the default output device
#[derive(Debug, Clone, Default)]
pub struct CpalOutputProvider;

impl OutputProvider for CpalOutputProvider {
    fn open(&self) -> Result<Arc<dyn AudioOutput>, AudioError> {
        Ok(Arc::new(CpalOutput::new()?))
    }
}

/// One scheduled unit inside the mixer
struct Voice {
    samples: Arc<[f32]>,
    start_frame: u64,
    // Source samples advanced per output frame
    step: f64,
    position: f64,
}

impl Voice {
    fn sample_at(&self) -> f32 {
        let idx = self.position.floor() as usize;
        let fract = (self.position - idx as f64) as f32;
        let a = self.samples.get(idx).copied().unwrap_or(0.0);
        let b = self.samples.get(idx + 1).copied().unwrap_or(0.0);
        a * (1.0 - fract) + b * fract
    }

    fn finished(&self) -> bool {
        self.position >= self.samples.len() as f64
    }
}

/// Mixes scheduled voices into output frames and counts rendered frames
struct Mixer {
    voices: HashMap<UnitId, Voice>,
    device_rate: u32,
    frames_rendered: Arc<AtomicU64>,
}

impl Mixer {
    fn new(device_rate: u32, frames_rendered: Arc<AtomicU64>) -> Self {
        Self {
            voices: HashMap::new(),
            device_rate,
            frames_rendered,
        }
    }

    fn schedule(&mut self, id: UnitId, unit: &PlaybackUnit) {
        let start_frame = (unit.scheduled_start() * self.device_rate as f64).round().max(0.0) as u64;
        let step = unit.sample_rate_hz() as f64 / self.device_rate as f64 * unit.playback_rate() as f64;
        self.voices.insert(
            id,
            Voice {
                samples: unit.shared_buffer(),
                start_frame,
                step,
                position: 0.0,
            },
        );
    }

    /// Fill an interleaved buffer, writing the mono mix to every channel
    fn render(&mut self, data: &mut [f32], channels: usize) {
        let base = self.frames_rendered.load(Ordering::Acquire);
        let mut frames = 0u64;

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            let now = base + i as u64;
            let mut mix = 0.0f32;
            for voice in self.voices.values_mut() {
                if now >= voice.start_frame && !voice.finished() {
                    mix += voice.sample_at();
                    voice.position += voice.step;
                }
            }
            let mix = mix.clamp(-1.0, 1.0);
            for channel in frame.iter_mut() {
                *channel = mix;
            }
            frames += 1;
        }

        self.voices.retain(|_, v| !v.finished());
        self.frames_rendered.store(base + frames, Ordering::Release);
    }
}

/// cpal output device exposing a monotonic clock derived from rendered frames.
///
/// The stream is owned by a dedicated thread; dropping the output stops it.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
    device_rate: u32,
    stop_sender: Option<Sender<()>>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("No output device found".to_string()))?;
        log::debug!("🔊 Using output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        let device_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels() as usize;
        log::info!("🔊 Output: {}Hz, {} channels", device_rate, channels);

        let frames_rendered = Arc::new(AtomicU64::new(0));
        let mixer = Arc::new(Mutex::new(Mixer::new(device_rate, frames_rendered.clone())));
        let callback_mixer = mixer.clone();

        let (stop_sender, stop_receiver) = mpsc::channel::<()>();
        let (init_sender, init_receiver) = mpsc::sync_channel::<Result<(), AudioError>>(1);

        let audio_thread = thread::spawn(move || {
            let stream = device.build_output_stream(
                &supported_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match callback_mixer.lock() {
                    Ok(mut mixer) => mixer.render(data, channels),
                    Err(_) => data.fill(0.0),
                },
                |err| log::error!("🔊 Output stream error: {}", err),
                None,
            );
            let stream = match stream.map_err(|e| AudioError::Stream(e.to_string())).and_then(|s| {
                s.play().map_err(|e| AudioError::Stream(e.to_string()))?;
                Ok(s)
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = init_sender.send(Err(e));
                    return;
                }
            };
            let _ = init_sender.send(Ok(()));

            let _ = stop_receiver.recv();
            drop(stream);
            log::debug!("🔊 Output thread exiting");
        });

        match init_receiver.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                mixer,
                frames_rendered,
                device_rate,
                stop_sender: Some(stop_sender),
                audio_thread: Some(audio_thread),
            }),
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Device("Output device did not start in time".to_string())),
        }
    }

    fn with_mixer(&self, f: impl FnOnce(&mut Mixer)) {
        match self.mixer.lock() {
            Ok(mut mixer) => f(&mut mixer),
            Err(_) => log::error!("🔊 Mixer lock poisoned"),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn start(&self, id: UnitId, unit: &PlaybackUnit) {
        self.with_mixer(|mixer| mixer.schedule(id, unit));
    }

    fn stop(&self, id: UnitId) {
        self.with_mixer(|mixer| {
            mixer.voices.remove(&id);
        });
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.send(());
        }
        if let Some(thread) = self.audio_thread.take() {
            if thread.join().is_err() {
                log::error!("🔊 Output thread panicked");
            }
        }
    }
}
