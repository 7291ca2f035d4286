//! Audio pipeline for duplex sessions: capture, wire codec and playback.

pub mod capture;
pub mod codec;
pub mod error;
pub mod playback;

pub use capture::{AudioCapture, BufferedSource, FrameSource};
pub use codec::{
    AudioChunk, AudioFormat, DEFAULT_CHUNK_MS, EncodedAudio, REALTIME_SAMPLE_RATE, encode_for_wire,
};
pub use error::AudioError;
pub use playback::{AudioSink, NullSink, PlaybackClip, ResponseAudio, WavSink};
