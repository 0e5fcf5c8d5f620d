//! Windowed FFT spectrum analysis with cached log-band binning

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Lower edge of the visualized frequency range.
const F_MIN: f32 = 50.0;
/// Upper edge; clamped to nyquist for low sample rates.
const F_MAX: f32 = 18_000.0;
/// Perceptual gain applied to each band after sqrt compression.
const BAND_GAIN: f32 = 1.8;

/// Cached bar-to-bin ranges, keyed by `(bar_count, sample_rate, spectrum_len)`.
///
/// `starts[b]..=ends[b]` are inclusive magnitude indices, monotonically
/// non-decreasing, always within `[1, spectrum_len - 1]`. Rebuilt only when
/// the key changes; a stale map would silently corrupt every bar, so the key
/// covers everything the ranges depend on.
struct BinMap {
    key: (usize, u32, usize),
    starts: Vec<usize>,
    ends: Vec<usize>,
}

impl BinMap {
    fn build(bar_count: usize, sample_rate: u32, spectrum_len: usize) -> Self {
        let mut starts = Vec::with_capacity(bar_count);
        let mut ends = Vec::with_capacity(bar_count);

        let nyquist = sample_rate as f32 / 2.0;
        let f_max = F_MAX.min(nyquist);
        let usable = spectrum_len.saturating_sub(1);

        if f_max <= F_MIN || usable == 0 {
            // Degenerate sample rate: callers get all-zero bars.
            starts.resize(bar_count, 1);
            ends.resize(bar_count, 0);
            return Self {
                key: (bar_count, sample_rate, spectrum_len),
                starts,
                ends,
            };
        }

        // Bin width = sample_rate / fft_size; spectrum_len = fft_size / 2.
        let hz_per_bin = sample_rate as f32 / (spectrum_len as f32 * 2.0);
        let ratio = f_max / F_MIN;
        let mut prev_end = 0usize;

        for b in 0..bar_count {
            let lo = F_MIN * ratio.powf(b as f32 / bar_count as f32);
            let hi = F_MIN * ratio.powf((b + 1) as f32 / bar_count as f32);

            let mut start = ((lo / hz_per_bin) as usize).clamp(1, usable);
            let mut end = ((hi / hz_per_bin) as usize).clamp(1, usable);

            // Narrow bands at low bar indices can collapse to zero width or
            // even run backwards; force each range forward of the last.
            start = start.max(prev_end.max(1).min(usable));
            end = end.max(start);
            prev_end = end;

            starts.push(start);
            ends.push(end);
        }

        Self {
            key: (bar_count, sample_rate, spectrum_len),
            starts,
            ends,
        }
    }

    fn is_degenerate(&self) -> bool {
        self.ends.first().map(|&e| e == 0).unwrap_or(true)
    }
}

/// Converts a time-domain sample window into a perceptually scaled bar
/// spectrum. Scratch buffers (FFT input, Hann coefficients, magnitudes) are
/// reused across calls of the same size.
pub struct SpectrumAnalyzer {
    planner: FftPlanner<f32>,
    fft: Option<Arc<dyn Fft<f32>>>,
    fft_size: usize,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    bin_map: Option<BinMap>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            fft: None,
            fft_size: 0,
            window: Vec::new(),
            scratch: Vec::new(),
            magnitudes: Vec::new(),
            bin_map: None,
        }
    }

    /// Compute the single-sided amplitude spectrum of `samples`.
    ///
    /// Window size is the next power of two >= `min(samples.len(), 4096)`;
    /// samples beyond it are ignored. The returned slice is a read-only
    /// snapshot valid until the next `analyze` call.
    pub fn analyze(&mut self, samples: &[f32]) -> &[f32] {
        if samples.is_empty() {
            self.magnitudes.clear();
            return &self.magnitudes;
        }

        let size = samples.len().min(4096).next_power_of_two();
        if size != self.fft_size {
            self.rebuild_scratch(size);
        }

        let n = self.fft_size;
        for i in 0..n {
            let s = if i < samples.len() { samples[i] } else { 0.0 };
            self.scratch[i] = Complex::new(s * self.window[i], 0.0);
        }

        // Plan is cached per size; rebuild_scratch installed it.
        self.fft
            .as_ref()
            .expect("fft plan set by rebuild_scratch")
            .process(&mut self.scratch);

        let scale = 2.0 / n as f32;
        self.magnitudes.clear();
        self.magnitudes
            .extend(self.scratch[..n / 2].iter().map(|c| c.norm() * scale));
        &self.magnitudes
    }

    /// Aggregate the most recent spectrum into `bar_count` log-spaced bands.
    ///
    /// Must be called after [`analyze`](Self::analyze); returns zeros when no
    /// spectrum is available or the sample rate is degenerate.
    pub fn bars(&mut self, bar_count: usize, sample_rate: u32) -> Vec<f32> {
        let mut out = vec![0.0f32; bar_count];
        if bar_count == 0 || self.magnitudes.is_empty() {
            return out;
        }

        let key = (bar_count, sample_rate, self.magnitudes.len());
        let rebuild = self.bin_map.as_ref().map(|m| m.key != key).unwrap_or(true);
        if rebuild {
            self.bin_map = Some(BinMap::build(bar_count, sample_rate, self.magnitudes.len()));
        }
        let map = self.bin_map.as_ref().expect("bin map just built");
        if map.is_degenerate() {
            return out;
        }

        for (b, bar) in out.iter_mut().enumerate() {
            let (start, end) = (map.starts[b], map.ends[b]);
            let slice = &self.magnitudes[start..=end];
            let avg = slice.iter().sum::<f32>() / slice.len() as f32;
            *bar = (avg.sqrt() * BAND_GAIN).clamp(0.0, 1.0);
        }
        out
    }

    /// Mean magnitude over `[lo_hz, hi_hz)` of the most recent spectrum.
    /// Used by the feature extractor for the fixed bass/mid/treble ranges.
    pub fn band_energy(&self, lo_hz: f32, hi_hz: f32, sample_rate: u32) -> f32 {
        band_energy(&self.magnitudes, lo_hz, hi_hz, sample_rate)
    }

    pub fn spectrum(&self) -> &[f32] {
        &self.magnitudes
    }

    fn rebuild_scratch(&mut self, size: usize) {
        self.fft_size = size;
        self.fft = Some(self.planner.plan_fft_forward(size));
        self.window = (0..size)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
            })
            .collect();
        self.scratch = vec![Complex::new(0.0, 0.0); size];
        self.magnitudes = Vec::with_capacity(size / 2);
        self.bin_map = None;
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean magnitude of `magnitudes` between `lo_hz` (inclusive) and `hi_hz`
/// (exclusive). Zero when the range holds no bins.
pub(crate) fn band_energy(magnitudes: &[f32], lo_hz: f32, hi_hz: f32, sample_rate: u32) -> f32 {
    if magnitudes.len() < 2 || sample_rate == 0 {
        return 0.0;
    }
    let hz_per_bin = sample_rate as f32 / (magnitudes.len() as f32 * 2.0);
    let start = ((lo_hz / hz_per_bin).ceil() as usize).clamp(1, magnitudes.len() - 1);
    let end = ((hi_hz / hz_per_bin) as usize).clamp(start, magnitudes.len() - 1);
    if end <= start {
        return 0.0;
    }
    magnitudes[start..end].iter().sum::<f32>() / (end - start) as f32
}
