//! Audio capture and analysis module

mod buffer;
mod device;
mod features;
mod sources;
mod spectrum;

pub use buffer::{CaptureBuffer, CaptureError};
pub use device::{start_capture, CaptureStream};
pub use features::{choose_window_size, FeatureExtractor, VisualizerFrame};
pub use sources::{list_sources, AudioSourceInfo, SourceError, SourceKind};
pub use spectrum::SpectrumAnalyzer;

/// One window of mono audio, normalized to `[-1, 1]`.
///
/// Immutable once produced; the sample rate is whatever the capture device
/// reported at the time the samples were written.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Root-mean-square level of the window, used for silence detection.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }
}

/// Sample encodings the capture path knows how to decode.
///
/// Anything else is silently dropped at `push` time; a bad driver must not
/// take down the visualizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
    I24,
    I32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::I24 => 3,
            SampleFormat::F32 | SampleFormat::I32 => 4,
        }
    }
}

/// A pull-based provider of fixed-size audio windows.
///
/// Implemented by [`CaptureBuffer`] for live capture; tests implement it
/// with synthetic signals.
pub trait AudioSource: Send + Sync {
    fn read_frame(
        &self,
        min_samples: usize,
    ) -> impl std::future::Future<Output = Result<AudioFrame, CaptureError>> + Send;
}
