//! Frame-rate throttling and fan-in for concurrent frame requests

use crate::audio::{
    choose_window_size, AudioSource, FeatureExtractor, SpectrumAnalyzer, VisualizerFrame,
};
use crate::config::ConfigStore;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frame computation errors.
///
/// `Clone` so a single failure can be delivered to every caller attached to
/// the same in-flight computation.
#[derive(Error, Debug, Clone)]
pub enum FrameError {
    #[error("Audio capture ended: {0}")]
    Capture(String),
}

struct Pipeline<S> {
    source: Arc<S>,
    analyzer: SpectrumAnalyzer,
    extractor: FeatureExtractor,
}

type SharedCompute = Shared<BoxFuture<'static, Result<Arc<VisualizerFrame>, FrameError>>>;

struct CoalescerState {
    cached: Option<(Arc<VisualizerFrame>, Instant)>,
    in_flight: Option<SharedCompute>,
    /// Throttle interval snapshot from the most recent computation's config.
    interval: Duration,
}

/// Public entry point of the pipeline: rate-limits frame computation to the
/// configured FPS and guarantees at most one pipeline execution at a time.
///
/// Callers inside the throttle window get the cached frame without
/// suspending. Callers that arrive while a computation is in flight attach
/// to it and all receive the same [`VisualizerFrame`]. A failed computation
/// is surfaced only to its awaiting callers; the previous cached frame stays
/// servable.
pub struct FrameCoalescer<S> {
    pipeline: Arc<tokio::sync::Mutex<Pipeline<S>>>,
    store: Arc<ConfigStore>,
    state: Arc<Mutex<CoalescerState>>,
}

impl<S: AudioSource + 'static> FrameCoalescer<S> {
    pub fn new(source: Arc<S>, store: Arc<ConfigStore>) -> Self {
        Self {
            pipeline: Arc::new(tokio::sync::Mutex::new(Pipeline {
                source,
                analyzer: SpectrumAnalyzer::new(),
                extractor: FeatureExtractor::new(),
            })),
            store,
            state: Arc::new(Mutex::new(CoalescerState {
                cached: None,
                in_flight: None,
                interval: Duration::from_millis(16),
            })),
        }
    }

    /// Get the current visualizer frame, computing one if the cache is
    /// stale.
    ///
    /// Cancellation-safe: dropping the returned future detaches this caller
    /// but the in-flight computation is driven to completion by a background
    /// task, so the cache and extractor state never see a half-finished
    /// frame.
    pub async fn next_frame(&self) -> Result<Arc<VisualizerFrame>, FrameError> {
        let fut = {
            let mut st = self.state.lock();

            if let Some((frame, at)) = &st.cached {
                if at.elapsed() < st.interval {
                    return Ok(frame.clone());
                }
            }

            if let Some(inflight) = &st.in_flight {
                inflight.clone()
            } else {
                let fut = compute(self.pipeline.clone(), self.store.clone())
                    .boxed()
                    .shared();
                st.in_flight = Some(fut.clone());
                tokio::spawn(drive(fut.clone(), self.state.clone(), self.store.clone()));
                fut
            }
        };

        fut.await
    }

    /// Most recent successfully computed frame, if any. Never suspends.
    pub fn last_frame(&self) -> Option<Arc<VisualizerFrame>> {
        self.state.lock().cached.as_ref().map(|(f, _)| f.clone())
    }
}

/// One full pipeline execution: config snapshot, window read, analysis.
async fn compute<S: AudioSource>(
    pipeline: Arc<tokio::sync::Mutex<Pipeline<S>>>,
    store: Arc<ConfigStore>,
) -> Result<Arc<VisualizerFrame>, FrameError> {
    let cfg = store.get().await.clamped();
    let window = choose_window_size(cfg.smoothing, cfg.target_fps);

    let mut pipe = pipeline.lock().await;
    let pipe = &mut *pipe;

    let frame = pipe
        .source
        .read_frame(window)
        .await
        .map_err(|e| FrameError::Capture(e.to_string()))?;

    let out = pipe
        .extractor
        .process(&frame, &mut pipe.analyzer, &cfg, Instant::now());
    Ok(Arc::new(out))
}

/// Drives a shared computation to completion and commits its result, so a
/// cancelled caller cannot leave the pipeline mid-frame or lose the cache
/// update.
async fn drive(
    fut: SharedCompute,
    state: Arc<Mutex<CoalescerState>>,
    store: Arc<ConfigStore>,
) {
    let result = fut.await;
    let interval = store.get().await.frame_interval();

    let mut st = state.lock();
    st.in_flight = None;
    st.interval = interval;
    match result {
        Ok(frame) => st.cached = Some((frame, Instant::now())),
        // Previous cache stays servable; the error reached the callers.
        Err(e) => log::debug!("Frame computation failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, CaptureError};
    use crate::config::VisualizerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Synthetic source: counts reads, optionally gates them on a
    /// semaphore, fails after a set number of successes.
    struct TestSource {
        reads: AtomicUsize,
        gate: Option<Semaphore>,
        fail_after: usize,
    }

    impl TestSource {
        fn new() -> Self {
            Self {
                reads: AtomicUsize::new(0),
                gate: None,
                fail_after: usize::MAX,
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new()
            }
        }

        fn failing_after(n: usize) -> Self {
            Self {
                fail_after: n,
                ..Self::new()
            }
        }
    }

    impl AudioSource for TestSource {
        async fn read_frame(&self, min_samples: usize) -> Result<AudioFrame, CaptureError> {
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.map_err(|_| CaptureError::Closed)?;
                permit.forget();
            }
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(CaptureError::Closed);
            }
            Ok(AudioFrame {
                samples: (0..min_samples)
                    .map(|i| {
                        0.5 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 48000.0).sin()
                    })
                    .collect(),
                sample_rate: 48000,
            })
        }
    }

    fn store_with_fps(fps: f32) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::in_memory(VisualizerConfig {
            target_fps: fps,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn fresh_cache_is_served_without_recompute() {
        let source = Arc::new(TestSource::new());
        let coalescer = FrameCoalescer::new(source.clone(), store_with_fps(10.0));

        let a = coalescer.next_frame().await.unwrap();
        let b = coalescer.next_frame().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_fan_in_to_one_computation() {
        let source = Arc::new(TestSource::gated());
        let coalescer = Arc::new(FrameCoalescer::new(source.clone(), store_with_fps(60.0)));

        let first = {
            let c = coalescer.clone();
            tokio::spawn(async move { c.next_frame().await })
        };
        let second = {
            let c = coalescer.clone();
            tokio::spawn(async move { c.next_frame().await })
        };

        // Let both callers attach before releasing the single read.
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.gate.as_ref().unwrap().add_permits(1);

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&a, &b), "fan-in must yield the same frame");
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_cache_triggers_a_new_computation() {
        let source = Arc::new(TestSource::new());
        let coalescer = FrameCoalescer::new(source.clone(), store_with_fps(240.0));

        let a = coalescer.next_frame().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = coalescer.next_frame().await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_surfaces_but_does_not_poison_cache() {
        let source = Arc::new(TestSource::failing_after(1));
        let coalescer = FrameCoalescer::new(source, store_with_fps(240.0));

        let first = coalescer.next_frame().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = coalescer.next_frame().await;
        assert!(matches!(err, Err(FrameError::Capture(_))));

        // Give the driver task a beat to finish its bookkeeping.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cached = coalescer.last_frame().expect("cache survives failure");
        assert!(Arc::ptr_eq(&first, &cached));
        assert!(coalescer.state.lock().in_flight.is_none());
    }

    #[tokio::test]
    async fn cancelled_caller_still_commits_the_frame() {
        let source = Arc::new(TestSource::gated());
        let coalescer = Arc::new(FrameCoalescer::new(source.clone(), store_with_fps(60.0)));

        let caller = {
            let c = coalescer.clone();
            tokio::spawn(async move { c.next_frame().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        let _ = caller.await;

        // Computation finishes in the background and lands in the cache.
        source.gate.as_ref().unwrap().add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coalescer.last_frame().is_some());
    }
}
