use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Capture contained no audio frames")]
    EmptyCapture,
    #[error("Capture is silent (peak amplitude {peak:.5})")]
    SilentCapture { peak: f32 },
    #[error("Frame {sequence} is {found}, expected {expected}")]
    FormatMismatch {
        sequence: u64,
        expected: String,
        found: String,
    },
    #[error("Sample rate must be positive, got {0} Hz")]
    InvalidSampleRate(u32),
    #[error("Invalid PCM16 payload: {0}")]
    InvalidEncoding(String),
    #[error("Resampler construction failed: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),
    #[error("Resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Capture thread panicked")]
    CaptureThreadPanicked,
}
