//! Background audio capture.
//!
//! A producer thread pulls frames from a [`FrameSource`] into a queue guarded
//! by a lock; the consumer drains it. `start` and `stop` are idempotent and
//! `stop_and_drain` returns every captured frame exactly once.

use crate::codec::{AudioChunk, AudioFormat};
use crate::error::AudioError;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A blocking producer of interleaved f32 frames.
pub trait FrameSource: Send + 'static {
    fn format(&self) -> AudioFormat;

    /// Blocks until the next frame is available. `None` once exhausted.
    fn read_frame(&mut self) -> Result<Option<Vec<f32>>, AudioError>;
}

/// Serves pre-recorded samples in fixed-size frames.
pub struct BufferedSource {
    format: AudioFormat,
    samples: Vec<f32>,
    frame_len: usize,
    position: usize,
    pacing: Option<Duration>,
}

impl BufferedSource {
    /// `frame_size` is in samples per channel. A zero sample rate is
    /// rejected.
    pub fn new(samples: Vec<f32>, format: AudioFormat, frame_size: usize) -> Result<Self, AudioError> {
        if format.sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate(0));
        }
        Ok(Self {
            format,
            samples,
            frame_len: frame_size.max(1) * format.channels.max(1) as usize,
            position: 0,
            pacing: None,
        })
    }

    /// Loads a WAV file, normalising integer samples to [-1.0, 1.0].
    pub fn from_wav(path: impl AsRef<Path>, frame_size: usize) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        info!(
            path = %path.as_ref().display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            samples = samples.len(),
            "Loaded WAV input"
        );
        Self::new(
            samples,
            AudioFormat::new(spec.sample_rate, spec.channels),
            frame_size,
        )
    }

    /// Sleeps for the frame's duration before each read, like a live device.
    pub fn paced(mut self) -> Self {
        let frames = self.frame_len / self.format.channels.max(1) as usize;
        self.pacing = Some(Duration::from_secs_f64(
            frames as f64 / self.format.sample_rate as f64,
        ));
        self
    }
}

impl FrameSource for BufferedSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_frame(&mut self) -> Result<Option<Vec<f32>>, AudioError> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        if let Some(interval) = self.pacing {
            std::thread::sleep(interval);
        }
        let end = (self.position + self.frame_len).min(self.samples.len());
        let frame = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(Some(frame))
    }
}

struct Shared {
    queue: Mutex<Vec<AudioChunk>>,
    running: AtomicBool,
    next_sequence: AtomicU64,
}

type Worker<S> = JoinHandle<(S, Result<(), AudioError>)>;

/// Owns a frame source and the producer thread reading it.
pub struct AudioCapture<S: FrameSource> {
    shared: Arc<Shared>,
    source: Option<S>,
    worker: Option<Worker<S>>,
}

impl<S: FrameSource> AudioCapture<S> {
    pub fn new(source: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
            }),
            source: Some(source),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// True once the producer thread has exited, e.g. its source ran dry.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_finished())
    }

    /// Number of frames waiting to be drained.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Spawns the producer thread. A no-op while already running.
    pub fn start(&mut self) -> Result<(), AudioError> {
        let Some(mut source) = self.source.take() else {
            debug!("Capture already running");
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::Release);

        let worker = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let format = source.format();
                while shared.running.load(Ordering::Acquire) {
                    match source.read_frame() {
                        Ok(Some(samples)) => {
                            let sequence = shared.next_sequence.fetch_add(1, Ordering::Relaxed);
                            shared.queue.lock().push(AudioChunk {
                                samples,
                                format,
                                sequence,
                            });
                        }
                        Ok(None) => {
                            debug!("Frame source exhausted");
                            break;
                        }
                        Err(e) => return (source, Err(e)),
                    }
                }
                (source, Ok(()))
            });

        match worker {
            Ok(handle) => {
                info!("Audio capture started");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(AudioError::Io(e))
            }
        }
    }

    /// Signals the producer and joins it. Stopping twice is a no-op.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.running.store(false, Ordering::Release);
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let (source, outcome) = handle
            .join()
            .map_err(|_| AudioError::CaptureThreadPanicked)?;
        self.source = Some(source);
        info!(pending = self.pending(), "Audio capture stopped");
        outcome
    }

    /// Takes every frame captured so far.
    pub fn drain(&self) -> Vec<AudioChunk> {
        std::mem::take(&mut *self.shared.queue.lock())
    }

    /// Stops the producer, then hands over everything it captured.
    pub fn stop_and_drain(&mut self) -> Result<Vec<AudioChunk>, AudioError> {
        self.stop()?;
        Ok(self.drain())
    }
}

impl<S: FrameSource> Drop for AudioCapture<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Audio capture did not stop cleanly");
        }
    }
}
