//! Visualizer configuration and its async store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

/// Renderer-facing tuning knobs, supplied per frame computation.
///
/// The pipeline treats a config as read-only input and clamps every field
/// before use; out-of-range values are normalized, never rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisualizerConfig {
    /// Number of spectrum bars, 4-256.
    pub bar_count: usize,

    /// How hard raw bar values are driven before smoothing, 0-1.
    pub responsiveness: f32,

    /// Exponential smoothing factor, 0-1; higher = smoother, slower.
    pub smoothing: f32,

    /// Target frame rate for the coalescer throttle, 10-240.
    pub target_fps: f32,

    /// Bass emphasis multiplier, 0-2 (1 = neutral).
    pub bass_emphasis: f32,

    /// Treble emphasis multiplier, 0-2 (1 = neutral).
    pub treble_emphasis: f32,

    /// Fade bars out over silence instead of letting them decay to zero.
    pub fade_on_silence: bool,

    /// Seconds to fade back in when sound returns.
    pub silence_fade_in_secs: f32,

    /// Seconds to fade out once silence is detected.
    pub silence_fade_out_secs: f32,

    /// Enable chroma-based dominant-pitch estimation.
    pub pitch_reactive: bool,

    /// RMS level below which a frame counts as silent.
    /// Historical builds shipped both `1e-3` and `2e-4`; tunable on purpose.
    pub silence_rms: f32,

    /// Spectral-flux threshold multiplier k in `mean + k * stddev`.
    /// Historical builds shipped 1.2-1.5; tunable on purpose.
    pub beat_sensitivity: f32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            bar_count: 48,
            responsiveness: 0.7,
            smoothing: 0.55,
            target_fps: 60.0,
            bass_emphasis: 1.0,
            treble_emphasis: 1.0,
            fade_on_silence: true,
            silence_fade_in_secs: 0.35,
            silence_fade_out_secs: 2.5,
            pitch_reactive: true,
            silence_rms: 1e-3,
            beat_sensitivity: 1.3,
        }
    }
}

impl VisualizerConfig {
    /// Return a copy with every field clamped to its documented range.
    pub fn clamped(&self) -> Self {
        Self {
            bar_count: self.bar_count.clamp(4, 256),
            responsiveness: self.responsiveness.clamp(0.0, 1.0),
            smoothing: self.smoothing.clamp(0.0, 1.0),
            target_fps: self.target_fps.clamp(10.0, 240.0),
            bass_emphasis: self.bass_emphasis.clamp(0.0, 2.0),
            treble_emphasis: self.treble_emphasis.clamp(0.0, 2.0),
            fade_on_silence: self.fade_on_silence,
            silence_fade_in_secs: self.silence_fade_in_secs.clamp(0.05, 30.0),
            silence_fade_out_secs: self.silence_fade_out_secs.clamp(0.05, 30.0),
            pitch_reactive: self.pitch_reactive,
            silence_rms: self.silence_rms.clamp(1e-6, 0.1),
            beat_sensitivity: self.beat_sensitivity.clamp(0.5, 3.0),
        }
    }

    /// Minimum frame interval implied by `target_fps`.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(1.0 / self.target_fps.clamp(10.0, 240.0))
    }
}

/// Config persistence errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// In-process config cache with optional JSON persistence.
///
/// Last write wins; readers always see the most recent `save`. The pipeline
/// snapshots a clamped copy per frame, so a mid-frame save takes effect on
/// the next computation.
pub struct ConfigStore {
    cache: RwLock<VisualizerConfig>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Purely in-memory store (tests, embedded use).
    pub fn in_memory(initial: VisualizerConfig) -> Self {
        Self {
            cache: RwLock::new(initial),
            path: None,
        }
    }

    /// Store backed by a JSON file; missing or unreadable files fall back to
    /// defaults rather than failing startup.
    pub async fn load(path: PathBuf) -> Self {
        let initial = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<VisualizerConfig>(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!("Ignoring malformed config at {}: {}", path.display(), e);
                    VisualizerConfig::default()
                }
            },
            Err(_) => VisualizerConfig::default(),
        };
        Self {
            cache: RwLock::new(initial),
            path: Some(path),
        }
    }

    pub async fn get(&self) -> VisualizerConfig {
        self.cache.read().await.clone()
    }

    pub async fn save(&self, config: VisualizerConfig) -> Result<(), ConfigError> {
        *self.cache.write().await = config.clone();
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&config)?;
            tokio::fs::write(path, json).await?;
        }
        Ok(())
    }
}
