use crate::error::AudioError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::time::Duration;
use tracing::debug;

/// Sample rate the realtime runtime expects for PCM16 audio in both directions.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Length of one `input_audio_buffer.append` payload.
pub const DEFAULT_CHUNK_MS: u32 = 100;

/// Peak amplitude under which a capture counts as silence (about -60 dBFS).
pub const SILENCE_PEAK: f32 = 1e-3;

const RESAMPLER_CHUNK: usize = 1024;

/// Sample rate and channel layout of a frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz / {} ch", self.sample_rate, self.channels)
    }
}

/// One captured frame of interleaved f32 samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub format: AudioFormat,
    /// Position in the capture stream, starting at 0.
    pub sequence: u64,
}

impl AudioChunk {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.frames(), self.format.sample_rate)
    }
}

/// A capture converted to the wire format: base64 PCM16LE mono chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub chunks: Vec<String>,
    pub sample_rate: u32,
    /// Total mono samples across all chunks.
    pub samples: usize,
}

impl EncodedAudio {
    pub fn duration(&self) -> Duration {
        samples_duration(self.samples, self.sample_rate)
    }
}

/// Playback time of `samples` mono samples at `sample_rate`.
pub fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, AudioError> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Converts a slice of f32 samples to i16, clamping out-of-range values.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Decodes one base64 PCM16LE fragment.
pub fn decode_i16(base64_fragment: &str) -> Result<Vec<i16>, AudioError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64_fragment)
        .map_err(|e| AudioError::InvalidEncoding(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(AudioError::InvalidEncoding(format!(
            "odd byte count {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    encode_i16(&convert_f32_to_i16(pcm32))
}

pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Result<Vec<f32>, AudioError> {
    Ok(convert_i16_to_f32(&decode_i16(base64_fragment)?))
}

/// Averages interleaved channels into one.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = channels as usize;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

pub fn is_silent(samples: &[f32]) -> bool {
    peak(samples) < SILENCE_PEAK
}

/// Resamples mono audio, preserving duration: the output holds exactly
/// `round(len * to / from)` samples.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if let Some(rate) = [from_rate, to_rate].into_iter().find(|&r| r == 0) {
        return Err(AudioError::InvalidSampleRate(rate));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let target_len =
        (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let mut resampler = create_resampler(from_rate as f64, to_rate as f64, RESAMPLER_CHUNK)?;
    let delay = resampler.output_delay();

    let mut out = Vec::with_capacity(target_len + delay + RESAMPLER_CHUNK);
    let mut pos = 0;
    while samples.len() - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let input = [&samples[pos..pos + n]];
        let frames = resampler.process(&input[..], None)?;
        out.extend_from_slice(&frames[0]);
        pos += n;
    }
    if pos < samples.len() {
        let input = [&samples[pos..]];
        let frames = resampler.process_partial(Some(&input[..]), None)?;
        out.extend_from_slice(&frames[0]);
    }
    // Flush the filter delay line.
    while out.len() < target_len + delay {
        let frames = resampler.process_partial(None::<&[&[f32]]>, None)?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let mut out = out.split_off(delay.min(out.len()));
    out.resize(target_len, 0.0);
    debug!(from_rate, to_rate, input = samples.len(), output = out.len(), "Resampled audio");
    Ok(out)
}

/// Converts captured frames to the wire format.
///
/// Frames must share one format. Multi-channel audio is downmixed, then
/// resampled to `target_rate`, quantised to PCM16LE and split into
/// `chunk_ms` pieces. Empty and silent captures are rejected.
pub fn encode_for_wire(
    chunks: &[AudioChunk],
    target_rate: u32,
    chunk_ms: u32,
) -> Result<EncodedAudio, AudioError> {
    let Some(first) = chunks.first() else {
        return Err(AudioError::EmptyCapture);
    };
    let format = first.format;
    if let Some(bad) = chunks.iter().find(|c| c.format != format) {
        return Err(AudioError::FormatMismatch {
            sequence: bad.sequence,
            expected: format.to_string(),
            found: bad.format.to_string(),
        });
    }

    let interleaved: Vec<f32> = chunks.iter().flat_map(|c| c.samples.iter().copied()).collect();
    let mono = downmix_to_mono(&interleaved, format.channels);
    if mono.is_empty() {
        return Err(AudioError::EmptyCapture);
    }
    let level = peak(&mono);
    if level < SILENCE_PEAK {
        return Err(AudioError::SilentCapture { peak: level });
    }

    let resampled = resample(&mono, format.sample_rate, target_rate)?;
    let pcm16 = convert_f32_to_i16(&resampled);
    let per_chunk = ((target_rate as u64 * chunk_ms as u64) / 1000).max(1) as usize;
    let encoded: Vec<String> = pcm16.chunks(per_chunk).map(encode_i16).collect();

    Ok(EncodedAudio {
        chunks: encoded,
        sample_rate: target_rate,
        samples: pcm16.len(),
    })
}
