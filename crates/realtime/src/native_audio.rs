//! Native audio devices on top of cpal.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on a
//! dedicated thread for its whole life. Capture hands mono samples from the
//! device callback to that thread through a bounded channel (dropping when
//! full) and resamples there. Playback resamples on the session side and feeds
//! the device callback through a lock-free ring buffer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use rubato::{FastFixedIn, Resampler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, TrySendError, sync_channel};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use voice_core::audio_utils::{convert_f32_to_i16, convert_i16_to_f32, create_resampler};
use voice_core::device::{AudioError, AudioInput, AudioOutput, CaptureSender};

/// Largest block handed to the resampler in one call.
const MAX_RESAMPLE_CHUNK: usize = 4_800;
/// Device callbacks queued between the capture callback and its worker.
const CAPTURE_BACKLOG: usize = 64;
/// Seconds of device-rate audio the playback ring can hold.
const PLAYBACK_RING_SECONDS: usize = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Resamples arbitrary-length blocks between two fixed rates.
struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
}

impl RateConverter {
    fn new(from: u32, to: u32) -> Result<Self, AudioError> {
        if from == to {
            return Ok(Self { resampler: None });
        }
        let resampler = create_resampler(from as f64, to as f64, MAX_RESAMPLE_CHUNK)
            .map_err(|e| AudioError::Resampler(e.to_string()))?;
        Ok(Self {
            resampler: Some(resampler),
        })
    }

    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };
        let mut out = Vec::new();
        for block in samples.chunks(MAX_RESAMPLE_CHUNK) {
            resampler
                .set_chunk_size(block.len())
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            let resampled = resampler
                .process(&[block], None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            if let Some(channel) = resampled.into_iter().next() {
                out.extend(channel);
            }
        }
        Ok(out)
    }
}

fn f32_config(supported: cpal::SupportedStreamConfig) -> Result<StreamConfig, AudioError> {
    if supported.sample_format() != SampleFormat::F32 {
        return Err(AudioError::UnsupportedConfig(format!(
            "sample format {:?}, need f32",
            supported.sample_format()
        )));
    }
    Ok(supported.config())
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("Audio thread panicked.");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The default microphone, delivered as mono PCM16 at `target_rate`.
pub struct NativeInput {
    target_rate: u32,
    worker: Option<Worker>,
}

impl NativeInput {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            worker: None,
        }
    }
}

impl AudioInput for NativeInput {
    fn start(&mut self, samples: CaptureSender) -> Result<(), AudioError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = sync_channel::<Result<(), AudioError>>(1);
        let target_rate = self.target_rate;
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || capture_thread(target_rate, samples, thread_stop, ready_tx))
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        let mut worker = Worker {
            stop,
            thread: Some(thread),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                worker.shutdown();
                Err(e)
            }
            Err(_) => {
                worker.shutdown();
                Err(AudioError::Stream("capture thread exited during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.thread.as_ref().is_some_and(|t| !t.is_finished()))
    }
}

fn capture_thread(
    target_rate: u32,
    samples: CaptureSender,
    stop: Arc<AtomicBool>,
    ready: std::sync::mpsc::SyncSender<Result<(), AudioError>>,
) {
    let (raw_tx, raw_rx) = sync_channel::<Vec<f32>>(CAPTURE_BACKLOG);

    let opened = (|| -> Result<_, AudioError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;
        info!(device = %device.name().unwrap_or_default(), "Using input device.");
        let config = f32_config(
            device
                .default_input_config()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?,
        )?;
        let channels = config.channels as usize;
        let device_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };
                    if let Err(TrySendError::Full(_)) = raw_tx.try_send(mono) {
                        debug!("Capture backlog full, dropping samples.");
                    }
                },
                |err| error!(error = %err, "Audio capture error."),
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
        let converter = RateConverter::new(device_rate, target_rate)?;
        info!(device_rate, target_rate, channels, "Capture stream running.");
        Ok((stream, converter))
    })();

    let (stream, mut converter) = match opened {
        Ok(opened) => {
            let _ = ready.send(Ok(()));
            opened
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        let block = match raw_rx.recv_timeout(POLL_INTERVAL) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match converter.process(&block) {
            Ok(resampled) => {
                if samples.send(convert_f32_to_i16(&resampled)).is_err() {
                    debug!("Capture receiver gone, stopping.");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Dropping capture block."),
        }
    }
    drop(stream);
    debug!("Capture thread finished.");
}

/// The default speaker, fed with mono PCM16 at `source_rate`.
pub struct NativeOutput {
    producer: HeapProd<f32>,
    converter: RateConverter,
    flush: Arc<AtomicBool>,
    source_rate: u32,
    device_rate: u32,
    _worker: Worker,
}

impl NativeOutput {
    pub fn open(source_rate: u32) -> Result<Self, AudioError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flush = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = sync_channel::<Result<(HeapProd<f32>, u32), AudioError>>(1);
        let thread_stop = stop.clone();
        let thread_flush = flush.clone();

        let thread = std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || playback_thread(thread_stop, thread_flush, ready_tx))
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        let mut worker = Worker {
            stop,
            thread: Some(thread),
        };

        let (producer, device_rate) = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                worker.shutdown();
                return Err(e);
            }
            Err(_) => {
                worker.shutdown();
                return Err(AudioError::Stream("playback thread exited during startup".to_string()));
            }
        };

        Ok(Self {
            producer,
            converter: RateConverter::new(source_rate, device_rate)?,
            flush,
            source_rate,
            device_rate,
            _worker: worker,
        })
    }
}

impl AudioOutput for NativeOutput {
    fn pending_samples(&self) -> usize {
        let queued = self.producer.occupied_len() as u64;
        (queued * self.source_rate as u64 / self.device_rate.max(1) as u64) as usize
    }

    fn write(&mut self, samples: &[i16]) -> usize {
        let resampled = match self.converter.process(&convert_i16_to_f32(samples)) {
            Ok(resampled) => resampled,
            Err(e) => {
                warn!(error = %e, "Dropping playback block.");
                return 0;
            }
        };
        let pushed = self.producer.push_slice(&resampled);
        if pushed < resampled.len() {
            debug!(dropped = resampled.len() - pushed, "Playback ring full.");
            return samples.len() * pushed / resampled.len().max(1);
        }
        samples.len()
    }

    fn clear(&mut self) {
        self.flush.store(true, Ordering::SeqCst);
    }
}

fn playback_thread(
    stop: Arc<AtomicBool>,
    flush: Arc<AtomicBool>,
    ready: std::sync::mpsc::SyncSender<Result<(HeapProd<f32>, u32), AudioError>>,
) {
    let opened = (|| -> Result<_, AudioError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        info!(device = %device.name().unwrap_or_default(), "Using output device.");
        let config = f32_config(
            device
                .default_output_config()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?,
        )?;
        let channels = config.channels as usize;
        let device_rate = config.sample_rate.0;

        let ring = HeapRb::<f32>::new(device_rate as usize * PLAYBACK_RING_SECONDS);
        let (producer, mut consumer) = ring.split();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if flush.swap(false, Ordering::SeqCst) {
                        consumer.clear();
                    }
                    for frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                |err| error!(error = %err, "Audio playback error."),
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
        info!(device_rate, channels, "Playback stream running.");
        Ok((stream, producer, device_rate))
    })();

    let stream = match opened {
        Ok((stream, producer, device_rate)) => {
            let _ = ready.send(Ok((producer, device_rate)));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        std::thread::park_timeout(POLL_INTERVAL);
    }
    drop(stream);
    debug!("Playback thread finished.");
}
