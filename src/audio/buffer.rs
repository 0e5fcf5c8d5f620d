//! Circular capture buffer with overlapping sliding-window reads

use super::{AudioFrame, AudioSource, SampleFormat};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture stream closed")]
    Closed,

    #[error("No audio host available")]
    NoHost,

    #[error("No capture device found")]
    NoDevice,

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Failed to get device config: {0}")]
    Config(String),

    #[error("Failed to build audio stream: {0}")]
    Stream(String),

    #[error("Failed to start stream: {0}")]
    Play(String),
}

struct RingState {
    samples: Vec<f32>,
    /// Read cursor; oldest valid sample.
    head: usize,
    /// Valid sample count, `<= samples.len()`.
    len: usize,
    /// Tail of the previously returned window, reused for overlap framing.
    carry: Vec<f32>,
}

impl RingState {
    fn push_sample(&mut self, s: f32) {
        let cap = self.samples.len();
        let idx = (self.head + self.len) % cap;
        self.samples[idx] = s;
        if self.len == cap {
            // Full: drop the oldest sample instead of blocking the producer.
            self.head = (self.head + 1) % cap;
        } else {
            self.len += 1;
        }
    }

    fn pop_into(&mut self, out: &mut Vec<f32>, n: usize) {
        debug_assert!(n <= self.len);
        for _ in 0..n {
            out.push(self.samples[self.head]);
            self.head = (self.head + 1) % self.samples.len();
            self.len -= 1;
        }
    }
}

/// Fixed-capacity ring of mono samples shared between the platform's capture
/// callback (producer) and the analysis pipeline (consumer).
///
/// The producer never blocks: when the ring is full the oldest samples are
/// dropped. Each push/read takes the lock exactly once and does no
/// allocation on the producer path.
pub struct CaptureBuffer {
    state: Mutex<RingState>,
    available: tokio::sync::Notify,
    closed: AtomicBool,
    sample_rate: AtomicU32,
}

impl CaptureBuffer {
    /// Create a buffer holding `capacity` mono samples (typically 30-60 ms
    /// worth of audio at the device rate).
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            state: Mutex::new(RingState {
                samples: vec![0.0; capacity.max(1)],
                head: 0,
                len: 0,
                carry: Vec::new(),
            }),
            available: tokio::sync::Notify::new(),
            closed: AtomicBool::new(false),
            sample_rate: AtomicU32::new(sample_rate),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Update the rate after a device hot-swap; affects frames produced from
    /// samples pushed after this call.
    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    /// Push already-normalized mono samples. Fast path for the cpal adapter,
    /// which downmixes in the stream callback.
    pub fn push_mono(&self, data: &[f32]) {
        if data.is_empty() {
            return;
        }
        {
            let mut st = self.state.lock();
            for &s in data {
                st.push_sample(s);
            }
        }
        self.available.notify_one();
    }

    /// Decode an interleaved PCM chunk to mono and push it.
    ///
    /// Channels are averaged. A chunk whose length is not a multiple of one
    /// interleaved frame has its trailing bytes ignored; `channels == 0` is
    /// dropped entirely.
    pub fn push(&self, bytes: &[u8], format: SampleFormat, channels: usize) {
        if channels == 0 || bytes.is_empty() {
            return;
        }
        let stride = format.bytes_per_sample();
        let frame_bytes = stride * channels;
        let frames = bytes.len() / frame_bytes;
        if frames == 0 {
            return;
        }

        {
            let mut st = self.state.lock();
            for f in 0..frames {
                let mut sum = 0.0f32;
                for ch in 0..channels {
                    let off = f * frame_bytes + ch * stride;
                    sum += decode_sample(&bytes[off..off + stride], format);
                }
                st.push_sample(sum / channels as f32);
            }
        }
        self.available.notify_one();
    }

    /// Signal end of capture (device stopped or hot-swapped). Pending and
    /// future reads fail with [`CaptureError::Closed`] once the ring cannot
    /// fill another hop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read one sliding window of `min_samples` samples.
    ///
    /// The first call (and the first call after `min_samples` changes)
    /// dequeues a full window; subsequent calls dequeue `min_samples / 4`
    /// fresh samples and reuse the retained tail of the previous window, so
    /// successive frames only ever move forward in the audio timeline.
    ///
    /// Waits until enough samples arrive. Dropping the returned future while
    /// waiting leaves the ring untouched: the hop is committed in a single
    /// locked region only when it can complete.
    pub async fn read_window(&self, min_samples: usize) -> Result<AudioFrame, CaptureError> {
        let min_samples = min_samples.max(4);
        let hop = min_samples / 4;

        loop {
            {
                let mut st = self.state.lock();
                if st.carry.len() == min_samples {
                    if st.len >= hop {
                        let retained = min_samples - hop;
                        let mut out = Vec::with_capacity(min_samples);
                        out.extend_from_slice(&st.carry[st.carry.len() - retained..]);
                        st.pop_into(&mut out, hop);
                        st.carry.clear();
                        st.carry.extend_from_slice(&out);
                        return Ok(AudioFrame {
                            samples: out,
                            sample_rate: self.sample_rate(),
                        });
                    }
                } else if st.len >= min_samples {
                    // Fresh window: first read, or the window size changed.
                    let mut out = Vec::with_capacity(min_samples);
                    st.pop_into(&mut out, min_samples);
                    st.carry.clear();
                    st.carry.extend_from_slice(&out);
                    return Ok(AudioFrame {
                        samples: out,
                        sample_rate: self.sample_rate(),
                    });
                }
            }

            if self.is_closed() {
                return Err(CaptureError::Closed);
            }
            self.available.notified().await;
        }
    }
}

impl AudioSource for CaptureBuffer {
    async fn read_frame(&self, min_samples: usize) -> Result<AudioFrame, CaptureError> {
        self.read_window(min_samples).await
    }
}

fn decode_sample(bytes: &[u8], format: SampleFormat) -> f32 {
    match format {
        SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleFormat::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleFormat::I24 => {
            // Sign-extend 24-bit little-endian into the top of an i32.
            let v = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            v as f32 / 8_388_608.0
        }
        SampleFormat::I32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
    }
}
