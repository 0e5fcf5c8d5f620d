//! Per-frame feature extraction: smoothing, silence, beats, pitch

use super::spectrum::band_energy;
use super::{AudioFrame, SpectrumAnalyzer};
use crate::config::VisualizerConfig;
use std::time::Instant;

/// Slots in the spectral-flux history ring.
const FLUX_HISTORY: usize = 64;
/// Minimum flux samples before the adaptive threshold is trusted.
const MIN_FLUX_SAMPLES: usize = 5;
/// Refractory period between beats, in milliseconds.
const BEAT_REFRACTORY_MS: u64 = 80;
/// Per-frame geometric decay of the peak-hold values.
const PEAK_DECAY: f32 = 0.985;
/// Smoothing cap while silent with fade disabled, for a faster decay.
const SILENT_SMOOTHING_CAP: f32 = 0.2;

/// One render-ready feature set. Immutable once produced; share freely
/// across render threads (the coalescer hands out `Arc<VisualizerFrame>`).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct VisualizerFrame {
    /// Smoothed per-bar amplitudes, each in `[0, 1]`.
    pub bars: Vec<f32>,

    /// Decaying per-bar maxima for peak-hold rendering.
    pub peaks: Vec<f32>,

    /// Band energies in `[0, 1]`: 20-250 Hz, 250-2000 Hz, 2000-16000 Hz.
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,

    /// Spectral-flux onset fired this frame.
    pub is_beat: bool,

    /// How far the flux cleared the adaptive threshold, `[0, 1]`.
    pub beat_strength: f32,

    /// Silence fade envelope, `[0, 1]`; 1 while sound is playing.
    pub silence_fade: f32,

    /// Dominant pitch class as a hue, `[0, 1)` (A = 9/12).
    pub pitch_hue: f32,

    /// Share of chroma energy in the dominant pitch class, `[0, 1]`.
    pub pitch_strength: f32,
}

/// Pick the FFT window for a latency/smoothness profile.
///
/// Low smoothing at high FPS wants the smallest window for latency; heavy
/// smoothing at relaxed FPS can afford the widest one.
pub fn choose_window_size(smoothing: f32, target_fps: f32) -> usize {
    if smoothing <= 0.3 && target_fps >= 120.0 {
        512
    } else if smoothing >= 0.7 && target_fps <= 60.0 {
        2048
    } else {
        1024
    }
}

/// Fixed-capacity ring of recent spectral-flux values, oldest overwritten
/// first. Only ever used for its rolling mean/stddev.
struct FluxHistory {
    slots: [f32; FLUX_HISTORY],
    len: usize,
    pos: usize,
}

impl FluxHistory {
    fn new() -> Self {
        Self {
            slots: [0.0; FLUX_HISTORY],
            len: 0,
            pos: 0,
        }
    }

    fn push(&mut self, value: f32) {
        self.slots[self.pos] = value;
        self.pos = (self.pos + 1) % FLUX_HISTORY;
        self.len = (self.len + 1).min(FLUX_HISTORY);
    }

    fn len(&self) -> usize {
        self.len
    }

    fn mean_std(&self) -> (f32, f32) {
        if self.len == 0 {
            return (0.0, 0.0);
        }
        let valid = &self.slots[..self.len];
        let mean = valid.iter().sum::<f32>() / self.len as f32;
        let var = valid
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f32>()
            / self.len as f32;
        (mean, var.sqrt())
    }
}

/// Per-bar decaying maximum for peak-hold rendering.
struct PeakTracker {
    peaks: Vec<f32>,
}

impl PeakTracker {
    fn new() -> Self {
        Self { peaks: Vec::new() }
    }

    fn reset(&mut self, bar_count: usize) {
        self.peaks.clear();
        self.peaks.resize(bar_count, 0.0);
    }

    fn update(&mut self, bars: &[f32]) -> &[f32] {
        debug_assert_eq!(self.peaks.len(), bars.len());
        for (peak, &bar) in self.peaks.iter_mut().zip(bars) {
            *peak = (*peak * PEAK_DECAY).max(bar);
        }
        &self.peaks
    }
}

/// Stateful per-frame feature computation.
///
/// Holds every piece of cross-frame state: previous smoothed bars, previous
/// magnitudes, flux history, beat timer, fade level. Owned explicitly so
/// multiple independent pipelines (multi-device) can coexist.
pub struct FeatureExtractor {
    prev_bars: Vec<f32>,
    prev_mags: Vec<f32>,
    flux: FluxHistory,
    last_beat: Option<Instant>,
    fade_level: f32,
    peaks: PeakTracker,
    last_process: Option<Instant>,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            prev_bars: Vec::new(),
            prev_mags: Vec::new(),
            flux: FluxHistory::new(),
            last_beat: None,
            fade_level: 1.0,
            peaks: PeakTracker::new(),
            last_process: None,
        }
    }

    /// Compute one [`VisualizerFrame`] from a raw capture window.
    ///
    /// `now` is passed in rather than sampled so callers (and tests) control
    /// the beat-refractory and fade clocks.
    pub fn process(
        &mut self,
        frame: &AudioFrame,
        analyzer: &mut SpectrumAnalyzer,
        config: &VisualizerConfig,
        now: Instant,
    ) -> VisualizerFrame {
        let cfg = config.clamped();

        let dt = self
            .last_process
            .map(|t| now.saturating_duration_since(t).as_secs_f32().min(0.25))
            .unwrap_or(1.0 / cfg.target_fps);
        self.last_process = Some(now);

        let rms = frame.rms();
        let is_silent = rms < cfg.silence_rms;
        let silent_hold = is_silent && cfg.fade_on_silence;

        // Bar-count change invalidates all per-bar state.
        if self.prev_bars.len() != cfg.bar_count {
            self.prev_bars = vec![0.0; cfg.bar_count];
            self.peaks.reset(cfg.bar_count);
        }

        if silent_hold {
            // Hold the last bar shape and let only the fade envelope move.
            // Magnitude history stays intact so sound resumes without a
            // spurious flux spike.
            self.flux.push(0.0);
            let fade = self.step_fade(true, dt, &cfg);
            let bars = self.prev_bars.clone();
            let peaks = self.peaks.update(&bars).to_vec();
            return VisualizerFrame {
                bars,
                peaks,
                silence_fade: fade,
                ..Default::default()
            };
        }

        let raw_bars = if is_silent {
            // Legacy decay path: zero input, capped smoothing below drains
            // the bars over a few frames.
            for m in self.prev_mags.iter_mut() {
                *m = 0.0;
            }
            vec![0.0; cfg.bar_count]
        } else {
            analyzer.analyze(&frame.samples);
            analyzer.bars(cfg.bar_count, frame.sample_rate)
        };

        // Beat detection on spectral flux, before prev_mags is replaced.
        let (is_beat, beat_strength) = if is_silent {
            self.flux.push(0.0);
            (false, 0.0)
        } else {
            let flux = self.spectral_flux(analyzer.spectrum());
            self.flux.push(flux);
            self.detect_beat(flux, cfg.beat_sensitivity, now)
        };

        if !is_silent {
            self.prev_mags.clear();
            self.prev_mags.extend_from_slice(analyzer.spectrum());
        }

        // Bass/treble emphasis, then exponential smoothing.
        let shaped = apply_emphasis(&raw_bars, cfg.bass_emphasis, cfg.treble_emphasis);
        let smoothing = if is_silent {
            cfg.smoothing.min(SILENT_SMOOTHING_CAP)
        } else {
            cfg.smoothing
        };
        let drive = 0.5 + 0.5 * cfg.responsiveness;
        for (prev, raw) in self.prev_bars.iter_mut().zip(&shaped) {
            let target = (raw * drive).clamp(0.0, 1.0);
            *prev = smoothing * *prev + (1.0 - smoothing) * target;
        }
        let bars = self.prev_bars.clone();
        let peaks = self.peaks.update(&bars).to_vec();

        // Fixed-range band energies over the raw spectrum.
        let (bass, mid, treble) = if is_silent {
            (0.0, 0.0, 0.0)
        } else {
            let rate = frame.sample_rate;
            let mags = analyzer.spectrum();
            (
                (band_energy(mags, 20.0, 250.0, rate).sqrt() * 2.0).clamp(0.0, 1.0),
                (band_energy(mags, 250.0, 2000.0, rate).sqrt() * 2.0).clamp(0.0, 1.0),
                (band_energy(mags, 2000.0, 16_000.0, rate).sqrt() * 2.0).clamp(0.0, 1.0),
            )
        };

        let (pitch_hue, pitch_strength) = if is_silent || !cfg.pitch_reactive {
            (0.0, 0.0)
        } else {
            dominant_pitch(analyzer.spectrum(), frame.sample_rate)
        };

        let silence_fade = self.step_fade(is_silent, dt, &cfg);

        VisualizerFrame {
            bars,
            peaks,
            bass,
            mid,
            treble,
            is_beat,
            beat_strength,
            silence_fade,
            pitch_hue,
            pitch_strength,
        }
    }

    /// Sum of positive per-bin magnitude increases since the previous frame,
    /// normalized by total magnitude. A spectrum-length change (window
    /// resize) resets the baseline to zero for one frame.
    fn spectral_flux(&self, mags: &[f32]) -> f32 {
        if mags.len() != self.prev_mags.len() {
            return 0.0;
        }
        let total: f32 = mags.iter().sum();
        if total <= f32::EPSILON {
            return 0.0;
        }
        let rise: f32 = mags
            .iter()
            .zip(&self.prev_mags)
            .map(|(cur, prev)| (cur - prev).max(0.0))
            .sum();
        rise / total
    }

    fn detect_beat(&mut self, flux: f32, sensitivity: f32, now: Instant) -> (bool, f32) {
        if self.flux.len() < MIN_FLUX_SAMPLES || flux <= 1e-6 {
            return (false, 0.0);
        }

        let (mean, std) = self.flux.mean_std();
        let threshold = mean + sensitivity * std;
        if flux <= threshold {
            return (false, 0.0);
        }

        let refractory = std::time::Duration::from_millis(BEAT_REFRACTORY_MS);
        if let Some(last) = self.last_beat {
            if now.saturating_duration_since(last) < refractory {
                return (false, 0.0);
            }
        }

        self.last_beat = Some(now);
        let strength = ((flux - threshold) / (0.5 * threshold + f32::EPSILON)).clamp(0.0, 1.0);
        (true, strength)
    }

    /// Ramp the fade envelope toward 0 during silence and 1 during sound,
    /// with independent in/out durations.
    fn step_fade(&mut self, is_silent: bool, dt: f32, cfg: &VisualizerConfig) -> f32 {
        if !cfg.fade_on_silence {
            self.fade_level = 1.0;
            return 1.0;
        }
        let step = if is_silent {
            -dt / cfg.silence_fade_out_secs
        } else {
            dt / cfg.silence_fade_in_secs
        };
        self.fade_level = (self.fade_level + step).clamp(0.0, 1.0);
        self.fade_level
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Reshape raw bars by position: bottom 45% weighted toward bass emphasis,
/// top 45% toward treble, linear taper to neutral through the middle.
fn apply_emphasis(bars: &[f32], bass: f32, treble: f32) -> Vec<f32> {
    let n = bars.len();
    if n == 0 {
        return Vec::new();
    }
    let bass = bass.clamp(0.0, 2.0);
    let treble = treble.clamp(0.0, 2.0);

    bars.iter()
        .enumerate()
        .map(|(i, &v)| {
            let t = if n > 1 { i as f32 / (n - 1) as f32 } else { 0.0 };
            let weight = if t < 0.45 {
                let alpha = 1.0 - t / 0.45;
                1.0 + (bass - 1.0) * alpha
            } else if t > 0.55 {
                let alpha = (t - 0.55) / 0.45;
                1.0 + (treble - 1.0) * alpha
            } else {
                1.0
            };
            (v * weight).clamp(0.0, 1.0)
        })
        .collect()
}

/// Chroma-histogram dominant pitch over 60-5000 Hz.
///
/// Returns `(hue, strength)`: hue is the dominant pitch class over 12,
/// strength its share of total chroma energy. Both zero when the range holds
/// no energy.
fn dominant_pitch(mags: &[f32], sample_rate: u32) -> (f32, f32) {
    if mags.len() < 2 || sample_rate == 0 {
        return (0.0, 0.0);
    }
    let hz_per_bin = sample_rate as f32 / (mags.len() as f32 * 2.0);
    let mut chroma = [0.0f32; 12];

    for (i, &mag) in mags.iter().enumerate().skip(1) {
        let freq = i as f32 * hz_per_bin;
        if !(60.0..=5000.0).contains(&freq) {
            continue;
        }
        let midi = 69.0 + 12.0 * (freq / 440.0).log2();
        let class = (midi.round() as i32).rem_euclid(12) as usize;
        chroma[class] += mag;
    }

    let total: f32 = chroma.iter().sum();
    if total <= f32::EPSILON {
        return (0.0, 0.0);
    }
    let (best, max) = chroma
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((0, 0.0));
    (best as f32 / 12.0, (max / total).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sine_frame(freq: f32, sample_rate: u32, n: usize, amp: f32) -> AudioFrame {
        AudioFrame {
            samples: (0..n)
                .map(|i| {
                    amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin()
                })
                .collect(),
            sample_rate,
        }
    }

    fn silent_frame(n: usize) -> AudioFrame {
        AudioFrame {
            samples: vec![0.0; n],
            sample_rate: 48000,
        }
    }

    fn assert_unit_range(v: f32, name: &str) {
        assert!((0.0..=1.0).contains(&v), "{name} out of range: {v}");
    }

    #[test]
    fn choose_window_size_profiles() {
        assert_eq!(choose_window_size(0.2, 144.0), 512);
        assert_eq!(choose_window_size(0.8, 30.0), 2048);
        assert_eq!(choose_window_size(0.5, 60.0), 1024);
        assert_eq!(choose_window_size(0.8, 120.0), 1024);
    }

    #[test]
    fn frame_outputs_stay_in_range() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig::default();
        let mut now = Instant::now();

        for freq in [55.0, 220.0, 1000.0, 8000.0] {
            let out = ex.process(&sine_frame(freq, 48000, 1024, 0.8), &mut an, &cfg, now);
            now += Duration::from_millis(16);

            assert_eq!(out.bars.len(), cfg.bar_count);
            assert_eq!(out.peaks.len(), cfg.bar_count);
            for &b in &out.bars {
                assert_unit_range(b, "bar");
            }
            assert_unit_range(out.bass, "bass");
            assert_unit_range(out.mid, "mid");
            assert_unit_range(out.treble, "treble");
            assert_unit_range(out.beat_strength, "beat_strength");
            assert_unit_range(out.silence_fade, "silence_fade");
            assert_unit_range(out.pitch_strength, "pitch_strength");
            assert!((0.0..1.0).contains(&out.pitch_hue));
        }
    }

    #[test]
    fn silence_with_fade_disabled_decays_bars_to_zero() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig {
            fade_on_silence: false,
            ..Default::default()
        };
        let mut now = Instant::now();

        ex.process(&sine_frame(220.0, 48000, 1024, 0.9), &mut an, &cfg, now);

        let mut last = Vec::new();
        for _ in 0..12 {
            now += Duration::from_millis(16);
            last = ex.process(&silent_frame(1024), &mut an, &cfg, now).bars;
        }
        assert!(
            last.iter().all(|&b| b < 1e-3),
            "bars did not decay: {:?}",
            &last[..4]
        );
    }

    #[test]
    fn silence_with_fade_holds_bar_shape_and_decays_envelope() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig {
            fade_on_silence: true,
            silence_fade_out_secs: 0.5,
            ..Default::default()
        };
        let mut now = Instant::now();

        for _ in 0..4 {
            ex.process(&sine_frame(220.0, 48000, 2048, 0.9), &mut an, &cfg, now);
            now += Duration::from_millis(16);
        }
        let loud_bars = ex.prev_bars.clone();
        assert!(loud_bars.iter().any(|&b| b > 0.05));

        now += Duration::from_millis(16);
        let a = ex.process(&silent_frame(1024), &mut an, &cfg, now);
        now += Duration::from_millis(100);
        let b = ex.process(&silent_frame(1024), &mut an, &cfg, now);

        assert_eq!(a.bars, loud_bars);
        assert_eq!(b.bars, loud_bars);
        assert!(b.silence_fade < a.silence_fade);
        assert!(a.silence_fade < 1.0);
    }

    #[test]
    fn fade_recovers_when_sound_returns() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig {
            silence_fade_in_secs: 0.1,
            silence_fade_out_secs: 0.2,
            ..Default::default()
        };
        let mut now = Instant::now();

        ex.process(&sine_frame(220.0, 48000, 1024, 0.9), &mut an, &cfg, now);
        for _ in 0..10 {
            now += Duration::from_millis(50);
            ex.process(&silent_frame(1024), &mut an, &cfg, now);
        }
        assert!(ex.fade_level < 0.1);

        for _ in 0..10 {
            now += Duration::from_millis(50);
            ex.process(&sine_frame(220.0, 48000, 1024, 0.9), &mut an, &cfg, now);
        }
        assert!(ex.fade_level > 0.9);
    }

    #[test]
    fn beat_refractory_blocks_back_to_back_beats() {
        let mut ex = FeatureExtractor::new();
        let now = Instant::now();

        // Prime history with quiet flux so any spike clears the threshold.
        for _ in 0..10 {
            ex.flux.push(0.01);
        }

        let (first, strength) = ex.detect_beat(0.9, 1.3, now);
        assert!(first);
        assert!(strength > 0.0);

        // 40 ms later: inside the 80 ms refractory window.
        let (second, s2) = ex.detect_beat(0.9, 1.3, now + Duration::from_millis(40));
        assert!(!second);
        assert_eq!(s2, 0.0);

        // Past the window: fires again.
        let (third, _) = ex.detect_beat(0.9, 1.3, now + Duration::from_millis(120));
        assert!(third);
    }

    #[test]
    fn beat_requires_history_and_nonzero_flux() {
        let mut ex = FeatureExtractor::new();
        let now = Instant::now();

        ex.flux.push(0.01);
        ex.flux.push(0.01);
        assert!(!ex.detect_beat(0.9, 1.3, now).0, "too little history");

        for _ in 0..10 {
            ex.flux.push(0.01);
        }
        assert!(!ex.detect_beat(0.0, 1.3, now).0, "zero flux");
    }

    #[test]
    fn tone_onset_after_silence_fires_beat() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig {
            fade_on_silence: false,
            ..Default::default()
        };
        let mut now = Instant::now();

        // Quiet (but not silent) noise floor to build flux history.
        for _ in 0..10 {
            let frame = AudioFrame {
                samples: (0..1024).map(|i| if i % 2 == 0 { 0.004 } else { -0.004 }).collect(),
                sample_rate: 48000,
            };
            ex.process(&frame, &mut an, &cfg, now);
            now += Duration::from_millis(16);
        }

        let out = ex.process(&sine_frame(220.0, 48000, 1024, 0.9), &mut an, &cfg, now);
        assert!(out.is_beat, "sudden onset should fire a beat");
        assert!(out.bass > 0.0);
    }

    #[test]
    fn pitch_of_a3_sine_maps_to_pitch_class_a() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig::default();

        let out = ex.process(
            &sine_frame(220.0, 48000, 4096, 0.8),
            &mut an,
            &cfg,
            Instant::now(),
        );
        // A3 -> MIDI 57 -> pitch class 9.
        assert!((out.pitch_hue - 9.0 / 12.0).abs() < 1e-6, "hue {}", out.pitch_hue);
        assert!(out.pitch_strength > 0.3);
    }

    #[test]
    fn pitch_disabled_reports_zero() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let cfg = VisualizerConfig {
            pitch_reactive: false,
            ..Default::default()
        };
        let out = ex.process(
            &sine_frame(440.0, 48000, 2048, 0.8),
            &mut an,
            &cfg,
            Instant::now(),
        );
        assert_eq!(out.pitch_hue, 0.0);
        assert_eq!(out.pitch_strength, 0.0);
    }

    #[test]
    fn bar_count_change_resets_per_bar_state() {
        let mut ex = FeatureExtractor::new();
        let mut an = SpectrumAnalyzer::new();
        let mut cfg = VisualizerConfig::default();
        let mut now = Instant::now();

        ex.process(&sine_frame(220.0, 48000, 1024, 0.8), &mut an, &cfg, now);
        assert_eq!(ex.prev_bars.len(), cfg.bar_count);

        cfg.bar_count = 12;
        now += Duration::from_millis(16);
        let out = ex.process(&sine_frame(220.0, 48000, 1024, 0.8), &mut an, &cfg, now);
        assert_eq!(out.bars.len(), 12);
        assert_eq!(out.peaks.len(), 12);
    }

    #[test]
    fn window_resize_resets_flux_baseline() {
        let mut ex = FeatureExtractor::new();
        ex.prev_mags = vec![0.0; 256];
        let new_mags = vec![1.0; 512];
        assert_eq!(ex.spectral_flux(&new_mags), 0.0);
    }

    #[test]
    fn peaks_decay_geometrically_and_hold_maxima() {
        let mut tracker = PeakTracker::new();
        tracker.reset(2);
        tracker.update(&[0.8, 0.2]);
        let after = tracker.update(&[0.0, 0.5]).to_vec();

        assert!((after[0] - 0.8 * PEAK_DECAY).abs() < 1e-6);
        assert_eq!(after[1], 0.5);
    }

    #[test]
    fn emphasis_boosts_ends_and_leaves_middle_alone() {
        let bars = vec![0.4; 11];
        let shaped = apply_emphasis(&bars, 2.0, 0.5);

        assert!(shaped[0] > 0.4 + 0.3, "full bass boost at bar 0");
        assert!((shaped[5] - 0.4).abs() < 1e-6, "middle untouched");
        assert!(shaped[10] < 0.4, "treble cut at the top");
        // Taper: closer to the middle, closer to neutral.
        assert!(shaped[1] < shaped[0]);
        assert!(shaped[9] > shaped[10]);
    }

    #[test]
    fn flux_history_overwrites_oldest() {
        let mut h = FluxHistory::new();
        for i in 0..(FLUX_HISTORY + 10) {
            h.push(i as f32);
        }
        assert_eq!(h.len(), FLUX_HISTORY);
        let (mean, _) = h.mean_std();
        // Values 10..74 survive.
        let expected = (10..(FLUX_HISTORY + 10)).sum::<usize>() as f32 / FLUX_HISTORY as f32;
        assert!((mean - expected).abs() < 1e-3);
    }
}
