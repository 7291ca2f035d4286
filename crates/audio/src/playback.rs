//! Response audio reassembly and playback sinks.

use crate::codec::{convert_i16_to_f32, decode_i16, samples_duration};
use crate::error::AudioError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Accumulates `response.audio.delta` payloads for one response.
///
/// Chunks are concatenated in arrival order; the transport already
/// guarantees ordering.
#[derive(Debug, Clone)]
pub struct ResponseAudio {
    samples: Vec<i16>,
    sample_rate: u32,
    chunks: usize,
}

impl ResponseAudio {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            chunks: 0,
        }
    }

    pub fn push_base64(&mut self, fragment: &str) -> Result<(), AudioError> {
        let decoded = decode_i16(fragment)?;
        self.samples.extend_from_slice(&decoded);
        self.chunks += 1;
        Ok(())
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }

    /// Closes out the response; only a finished clip can be played.
    pub fn finish(self) -> PlaybackClip {
        debug!(chunks = self.chunks, samples = self.samples.len(), "Response audio reassembled");
        PlaybackClip {
            samples: self.samples,
            sample_rate: self.sample_rate,
        }
    }
}

/// Complete mono PCM16 audio of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackClip {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl PlaybackClip {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }

    pub fn to_f32(&self) -> Vec<f32> {
        convert_i16_to_f32(&self.samples)
    }

    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<(), AudioError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

/// Destination for completed response audio.
pub trait AudioSink: Send {
    fn play(&mut self, clip: &PlaybackClip) -> Result<(), AudioError>;
}

/// Writes each non-empty clip to `<dir>/<prefix>-NNN.wav`.
pub struct WavSink {
    dir: PathBuf,
    prefix: String,
    written: Vec<PathBuf>,
}

impl WavSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, AudioError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            written: Vec::new(),
        })
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl AudioSink for WavSink {
    fn play(&mut self, clip: &PlaybackClip) -> Result<(), AudioError> {
        if clip.is_empty() {
            return Ok(());
        }
        let path = self
            .dir
            .join(format!("{}-{:03}.wav", self.prefix, self.written.len() + 1));
        clip.write_wav(&path)?;
        info!(path = %path.display(), duration_ms = clip.duration().as_millis() as u64, "Wrote response audio");
        self.written.push(path);
        Ok(())
    }
}

/// Discards audio, counting clips.
#[derive(Debug, Default)]
pub struct NullSink {
    played: usize,
}

impl NullSink {
    pub fn played(&self) -> usize {
        self.played
    }
}

impl AudioSink for NullSink {
    fn play(&mut self, _clip: &PlaybackClip) -> Result<(), AudioError> {
        self.played += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{REALTIME_SAMPLE_RATE, encode_i16};

    #[test]
    fn test_chunks_concatenate_in_arrival_order() {
        let mut audio = ResponseAudio::new(REALTIME_SAMPLE_RATE);
        audio.push_base64(&encode_i16(&[1, 2, 3])).unwrap();
        audio.push_base64(&encode_i16(&[])).unwrap();
        audio.push_base64(&encode_i16(&[4, 5])).unwrap();
        assert_eq!(audio.chunks(), 3);

        let clip = audio.finish();
        assert_eq!(clip.samples(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_bad_chunk_is_rejected_without_corrupting_buffer() {
        let mut audio = ResponseAudio::new(REALTIME_SAMPLE_RATE);
        audio.push_base64(&encode_i16(&[7])).unwrap();
        assert!(audio.push_base64("%%%").is_err());
        assert_eq!(audio.finish().samples(), &[7]);
    }

    #[test]
    fn test_clip_duration() {
        let clip = PlaybackClip::new(vec![0; 12_000], REALTIME_SAMPLE_RATE);
        assert_eq!(clip.duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_wav_sink_numbers_files_and_skips_empty_clips() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = WavSink::new(dir.path().join("replies"), "reply").unwrap();

        sink.play(&PlaybackClip::new(vec![100, -100, 0], REALTIME_SAMPLE_RATE))
            .unwrap();
        sink.play(&PlaybackClip::new(Vec::new(), REALTIME_SAMPLE_RATE))
            .unwrap();
        sink.play(&PlaybackClip::new(vec![5; 10], REALTIME_SAMPLE_RATE))
            .unwrap();

        let names: Vec<String> = sink
            .written()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["reply-001.wav", "reply-002.wav"]);

        let mut reader = hound::WavReader::open(&sink.written()[0]).unwrap();
        assert_eq!(reader.spec().sample_rate, REALTIME_SAMPLE_RATE);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![100, -100, 0]);
    }
}
