//! pulseviz
//!
//! Turns a live audio stream into a continuously updated, render-ready
//! feature set: per-band amplitude bars, band energies, a beat pulse, a
//! dominant-pitch estimate, and a silence-driven fade envelope.
//!
//! Pipeline: capture callback -> [`CaptureBuffer`] -> [`SpectrumAnalyzer`]
//! -> [`FeatureExtractor`] -> [`VisualizerFrame`] -> [`FrameCoalescer`]
//! cache -> renderer. The coalescer is the public entry point; everything
//! upstream is private per-session state.
//!
//! ```no_run
//! use pulseviz::{ConfigStore, FrameCoalescer, VisualizerConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = pulseviz::audio::start_capture(None)?;
//! let store = Arc::new(ConfigStore::in_memory(VisualizerConfig::default()));
//! let frames = FrameCoalescer::new(stream.buffer().clone(), store);
//!
//! let frame = frames.next_frame().await?;
//! println!("{} bars, beat: {}", frame.bars.len(), frame.is_beat);
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod coalescer;
pub mod config;

pub use audio::{
    AudioFrame, AudioSource, CaptureBuffer, CaptureError, FeatureExtractor, SpectrumAnalyzer,
    VisualizerFrame,
};
pub use coalescer::{FrameCoalescer, FrameError};
pub use config::{ConfigStore, VisualizerConfig};
