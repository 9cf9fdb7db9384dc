// Audio peripheral: a DMA-style byte ring between the capture side and the sampling task.

use crate::{AudioSource, HardwareError};
use async_trait::async_trait;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use somnode_types::AudioConfig;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Creates the peripheral ring. `capacity` and every push are rounded to whole frames.
pub fn dma_ring(capacity: usize, frame_bytes: usize) -> (DmaWriter, DmaAudioSource) {
    let frame_bytes = frame_bytes.max(1);
    let capacity = (capacity / frame_bytes).max(1) * frame_bytes;
    let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
    let notify = Arc::new(Notify::new());
    (
        DmaWriter {
            producer,
            notify: notify.clone(),
            frame_bytes,
            dropped_bytes: 0,
        },
        DmaAudioSource { consumer, notify },
    )
}

/// Capture side of the ring (the "DMA engine").
pub struct DmaWriter {
    producer: HeapProducer<u8>,
    notify: Arc<Notify>,
    frame_bytes: usize,
    dropped_bytes: u64,
}

impl DmaWriter {
    /// Writes as many whole frames as fit. The rest is lost, as on an overflowing
    /// hardware buffer. Returns the number of bytes written.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let fits = self.producer.free_len().min(bytes.len());
        let whole = fits - fits % self.frame_bytes;
        let written = self.producer.push_slice(&bytes[..whole]);
        if written < bytes.len() {
            let lost = (bytes.len() - written) as u64;
            self.dropped_bytes += lost;
            trace!(lost, total_dropped = self.dropped_bytes, "Audio ring overflow");
        }
        if written > 0 {
            self.notify.notify_one();
        }
        written
    }

    /// Bytes discarded because the reader fell behind.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}

/// Reader side of the ring; what the sampling task drains.
pub struct DmaAudioSource {
    consumer: HeapConsumer<u8>,
    notify: Arc<Notify>,
}

#[async_trait]
impl AudioSource for DmaAudioSource {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, HardwareError> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.consumer.pop_slice(buf);
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            if time::timeout(deadline - now, self.notify.notified()).await.is_err() {
                return Ok(0);
            }
        }
    }
}

/// Appends one sample in `[-1.0, 1.0]` as little-endian signed PCM of `bits` width.
pub(crate) fn encode_sample(value: f32, bits: u16, out: &mut Vec<u8>) {
    let bytes = usize::from(bits / 8).clamp(1, 4);
    let full_scale = ((1i64 << (bytes * 8 - 1)) - 1) as f64;
    let scaled = (f64::from(value.clamp(-1.0, 1.0)) * full_scale) as i32;
    out.extend_from_slice(&scaled.to_le_bytes()[..bytes]);
}

/// Sine source standing in for the microphone on the simulated I2S bus.
struct ToneGenerator {
    phase: f64,
    step: f64,
}

impl ToneGenerator {
    fn new(frequency_hz: f64, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency_hz / f64::from(sample_rate),
        }
    }

    fn fill(&mut self, out: &mut Vec<u8>, frames: usize, channels: u16, bits: u16) {
        out.clear();
        for _ in 0..frames {
            let value = (self.phase.sin() * 0.25) as f32;
            for _ in 0..channels {
                encode_sample(value, bits, out);
            }
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// Runs a synthetic I2S peripheral that writes one DMA buffer (`dma_buf_len`
/// frames) into the ring every `dma_buf_len / sample_rate` seconds.
pub fn spawn_simulated_i2s(
    config: &AudioConfig,
    mut writer: DmaWriter,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let frames = config.dma_buf_len;
    let channels = config.channels;
    let bits = config.bits_per_sample;
    let sample_rate = config.sample_rate;
    let period = Duration::from_secs_f64(frames as f64 / f64::from(sample_rate.max(1)));

    tokio::spawn(async move {
        info!(sample_rate, channels, bits, ?period, "Simulated I2S peripheral started.");
        let mut tone = ToneGenerator::new(440.0, sample_rate);
        let mut dma_buf = Vec::with_capacity(frames * usize::from(channels) * usize::from(bits / 8));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    tone.fill(&mut dma_buf, frames, channels, bits);
                    writer.push(&dma_buf);
                }
            }
        }
        debug!(dropped_bytes = writer.dropped_bytes(), "Simulated I2S peripheral stopped.");
    })
}

#[cfg(feature = "host-audio")]
pub mod host {
    //! Host microphone capture through cpal, feeding the same DMA ring.

    use super::{encode_sample, DmaWriter};
    use crate::HardwareError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{InputCallbackInfo, SampleFormat, StreamError};
    use somnode_types::AudioConfig;
    use tracing::{debug, error, info};

    /// Keeps the capture stream alive. Dropping it stops the stream.
    pub struct StreamControl {
        _stream: cpal::Stream,
    }

    /// Starts capturing from the configured (or default) input device into `writer`.
    pub fn start_host_input(config: &AudioConfig, mut writer: DmaWriter) -> Result<StreamControl, HardwareError> {
        let host = cpal::default_host();
        let device = match config.device.as_deref() {
            Some(name) => host
                .input_devices()
                .map_err(|e| HardwareError::AudioDevice(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| HardwareError::DeviceNotFound(name.to_string()))?,
            None => host
                .default_input_device()
                .ok_or_else(|| HardwareError::DeviceNotFound("Default input device".to_string()))?,
        };
        info!(
            "Using audio input device: {}",
            device.name().map_err(|e| HardwareError::AudioDevice(e.to_string()))?
        );

        let supported = device
            .default_input_config()
            .map_err(|e| HardwareError::AudioDevice(e.to_string()))?;
        if supported.sample_format() != SampleFormat::F32 {
            error!("Unsupported sample format: {:?}. Only F32 is handled.", supported.sample_format());
            return Err(HardwareError::UnsupportedSampleFormat);
        }
        let mut stream_config = supported.config();
        stream_config.channels = config.channels;
        stream_config.sample_rate = cpal::SampleRate(config.sample_rate);

        let bits = config.bits_per_sample;
        let mut scratch: Vec<u8> = Vec::new();
        let data_callback = move |data: &[f32], _: &InputCallbackInfo| {
            scratch.clear();
            for &sample in data {
                encode_sample(sample, bits, &mut scratch);
            }
            writer.push(&scratch);
        };
        let err_fn = |err: StreamError| {
            error!("An error occurred on audio input stream: {}", err);
        };

        debug!("Building input stream with config: {:?}", stream_config);
        let stream = device
            .build_input_stream(&stream_config, data_callback, err_fn, None)
            .map_err(|e| HardwareError::AudioDevice(e.to_string()))?;
        stream.play().map_err(|e| HardwareError::AudioDevice(e.to_string()))?;
        info!("Audio input stream started successfully.");

        Ok(StreamControl { _stream: stream })
    }
}
