use super::capture::{MicSource, MicrophoneProvider, WindowCallback};
use super::codec::{CAPTURE_WINDOW, INPUT_SAMPLE_RATE};
use super::AudioError;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

/// Device-rate samples fed to the resampler per call
const RESAMPLER_CHUNK: usize = 1024;
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the system microphone (default device unless a name is given)
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophoneProvider {
    pub device_name: Option<String>,
}

impl CpalMicrophoneProvider {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl MicrophoneProvider for CpalMicrophoneProvider {
    fn open(&self) -> Result<Box<dyn MicSource>, AudioError> {
        // Probe now so a missing device fails before any connection is made
        find_device(self.device_name.as_deref())?;
        Ok(Box::new(CpalMicrophone {
            device_name: self.device_name.clone(),
            stop_sender: None,
            handle: None,
        }))
    }
}

fn find_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(id) => host
            .input_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| AudioError::Device(format!("Device not found: {}", id))),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::Device("No default input device found".into())),
    }
}

/// Microphone capture delivering mono 16 kHz windows of `CAPTURE_WINDOW` samples.
///
/// The cpal stream lives on a dedicated thread for its whole life; dropping the
/// microphone stops the stream and releases the device.
pub struct CpalMicrophone {
    device_name: Option<String>,
    stop_sender: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MicSource for CpalMicrophone {
    fn start(&mut self, on_window: WindowCallback) -> Result<(), AudioError> {
        if self.handle.is_some() {
            return Err(AudioError::Stream("Microphone already started".to_string()));
        }

        let (stop_sender, stop_receiver) = mpsc::channel();
        let (init_sender, init_receiver) = mpsc::sync_channel(1);
        let device_name = self.device_name.clone();

        let handle = thread::spawn(move || {
            let stream = match Self::open_stream(device_name.as_deref(), on_window) {
                Ok(stream) => {
                    let _ = init_sender.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = init_sender.send(Err(e));
                    return;
                }
            };
            Self::hold_until_stopped(stream, stop_receiver);
        });

        match init_receiver.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(())) => {
                self.stop_sender = Some(stop_sender);
                self.handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                drop(stop_sender);
                Err(AudioError::Device("Microphone did not start in time".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("🎤 Capture thread panicked");
            }
            log::info!("🎤 Microphone released");
        }
    }
}

impl CpalMicrophone {
    fn hold_until_stopped(stream: CpalStream, stop_receiver: Receiver<()>) {
        // Returns on an explicit stop or when the sender is dropped
        let _ = stop_receiver.recv();
        drop(stream);
    }

    fn open_stream(device_name: Option<&str>, on_window: WindowCallback) -> Result<CpalStream, AudioError> {
        let device = find_device(device_name)?;
        log::info!("🎤 Using input device: {:?}", device.name());

        let supported_config = match Self::select_input_config(&device) {
            Ok(config) => config,
            Err(err) => {
                log::warn!(
                    "⚠️  Failed to select preferred input config: {}. Falling back to default input config.",
                    err
                );
                device
                    .default_input_config()
                    .map_err(|e| AudioError::Config(e.to_string()))?
            }
        };

        let stream_config = supported_config.config();
        let hardware_sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!(
            "🎤 Hardware: {}Hz, {} channels, {:?} → {}Hz mono windows of {}",
            hardware_sample_rate,
            channels,
            supported_config.sample_format(),
            INPUT_SAMPLE_RATE,
            CAPTURE_WINDOW
        );

        let resampler = if hardware_sample_rate != INPUT_SAMPLE_RATE {
            let ratio = INPUT_SAMPLE_RATE as f64 / hardware_sample_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, 1)
                .map_err(|e| AudioError::Resampling(e.to_string()))?;
            log::info!(
                "🔄 Created resampler: {}Hz → {}Hz (ratio: {:.3})",
                hardware_sample_rate,
                INPUT_SAMPLE_RATE,
                ratio
            );
            Some(resampler)
        } else {
            None
        };

        let windower = Windower::new(resampler, on_window);
        let stream = match supported_config.sample_format() {
            SampleFormat::I16 => Self::create_input_stream::<i16>(&device, &stream_config, channels, windower)?,
            SampleFormat::U16 => Self::create_input_stream::<u16>(&device, &stream_config, channels, windower)?,
            SampleFormat::F32 => Self::create_input_stream::<f32>(&device, &stream_config, channels, windower)?,
            other => {
                return Err(AudioError::Config(format!("Unsupported sample format: {:?}", other)));
            }
        };

        stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
        log::info!("🎤 Microphone capture started");
        Ok(stream)
    }

    fn select_input_config(device: &Device) -> Result<cpal::SupportedStreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::Config(e.to_string()))?;

        let mut best_config: Option<cpal::SupportedStreamConfig> = None;
        let mut best_format_rank = u8::MAX;
        let mut best_rate_diff = u32::MAX;

        for config_range in configs {
            let format_rank = match config_range.sample_format() {
                SampleFormat::F32 => 0,
                SampleFormat::I16 => 1,
                SampleFormat::U16 => 2,
                _ => continue,
            };

            let chosen_rate = INPUT_SAMPLE_RATE.clamp(
                config_range.min_sample_rate().0,
                config_range.max_sample_rate().0,
            );
            let rate_diff = chosen_rate.abs_diff(INPUT_SAMPLE_RATE);

            if format_rank < best_format_rank || (format_rank == best_format_rank && rate_diff < best_rate_diff) {
                best_format_rank = format_rank;
                best_rate_diff = rate_diff;
                best_config = Some(config_range.with_sample_rate(cpal::SampleRate(chosen_rate)));
            }
        }

        best_config.ok_or_else(|| AudioError::Config("No supported input configs found".to_string()))
    }

    fn create_input_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        channels: usize,
        mut windower: Windower,
    ) -> Result<CpalStream, AudioError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        f32: FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _| {
                    // Channel 0 only
                    windower.push(data.chunks(channels).filter_map(|frame| frame.first()).map(|s| f32::from_sample(*s)));
                },
                |err| log::error!("🎤 Audio stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collects device samples, resamples them to 16 kHz and cuts fixed windows
struct Windower {
    resampler: Option<SincFixedIn<f32>>,
    device_buffer: Vec<f32>,
    window_buffer: Vec<f32>,
    on_window: WindowCallback,
}

impl Windower {
    fn new(resampler: Option<SincFixedIn<f32>>, on_window: WindowCallback) -> Self {
        Self {
            resampler,
            device_buffer: Vec::with_capacity(RESAMPLER_CHUNK * 2),
            window_buffer: Vec::with_capacity(CAPTURE_WINDOW * 2),
            on_window,
        }
    }

    fn push(&mut self, samples: impl Iterator<Item = f32>) {
        match self.resampler.as_mut() {
            None => self.window_buffer.extend(samples),
            Some(resampler) => {
                self.device_buffer.extend(samples);
                while self.device_buffer.len() >= RESAMPLER_CHUNK {
                    let chunk: Vec<f32> = self.device_buffer.drain(..RESAMPLER_CHUNK).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut output) => self.window_buffer.append(&mut output[0]),
                        Err(e) => log::error!("🔄 Resampling error: {}", e),
                    }
                }
            }
        }

        while self.window_buffer.len() >= CAPTURE_WINDOW {
            let window: Vec<f32> = self.window_buffer.drain(..CAPTURE_WINDOW).collect();
            (self.on_window)(&window);
        }
    }
}
