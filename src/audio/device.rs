//! cpal capture adapter: feeds a device stream into a CaptureBuffer

use super::{CaptureBuffer, CaptureError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Command {
    Stop,
}

/// Handle to a running capture stream.
///
/// The cpal stream is `!Send`, so it lives on a dedicated thread the same
/// way the buffer's producer callback does; this handle only carries the
/// command channel and the shared buffer.
pub struct CaptureStream {
    command_tx: mpsc::Sender<Command>,
    thread_handle: Option<JoinHandle<()>>,
    buffer: Arc<CaptureBuffer>,
}

impl CaptureStream {
    pub fn buffer(&self) -> &Arc<CaptureBuffer> {
        &self.buffer
    }

    /// Stop the stream and close the buffer, cancelling pending reads.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(Command::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.buffer.close();
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start capturing from the given source id.
///
/// Source ids follow the enumeration format: `system_audio` (default-output
/// loopback), `output:<name>`, `input:<name>`. `None` falls back to system
/// loopback. Stream failures after startup close the buffer, so consumers
/// see [`CaptureError::Closed`] instead of hanging.
pub fn start_capture(source_id: Option<String>) -> Result<CaptureStream, CaptureError> {
    let (command_tx, command_rx) = mpsc::channel();
    // Rate is corrected once the device config is known.
    let buffer = Arc::new(CaptureBuffer::new(48000 * 60 / 1000, 48000));

    let thread_buffer = buffer.clone();
    let thread_handle = thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            if let Err(e) = run_capture_thread(source_id, command_rx, thread_buffer.clone()) {
                log::error!("Capture thread error: {}", e);
            }
            // Always unblock consumers, whatever stopped us.
            thread_buffer.close();
        })
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    Ok(CaptureStream {
        command_tx,
        thread_handle: Some(thread_handle),
        buffer,
    })
}

fn run_capture_thread(
    source_id: Option<String>,
    command_rx: mpsc::Receiver<Command>,
    buffer: Arc<CaptureBuffer>,
) -> Result<(), CaptureError> {
    let host = cpal::default_host();
    let mut is_loopback = false;

    let device = match source_id.as_deref() {
        Some("system_audio") | None => {
            log::info!("Using default output device for system audio loopback");
            is_loopback = true;
            host.default_output_device().ok_or(CaptureError::NoDevice)?
        }
        Some(id) if id.starts_with("output:") => {
            let name = id.trim_start_matches("output:");
            is_loopback = true;
            host.output_devices()
                .map_err(|e| CaptureError::Config(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::SourceNotFound(name.to_string()))?
        }
        Some(id) if id.starts_with("input:") => {
            let name = id.trim_start_matches("input:");
            host.input_devices()
                .map_err(|e| CaptureError::Config(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::SourceNotFound(name.to_string()))?
        }
        Some(other) => return Err(CaptureError::SourceNotFound(other.to_string())),
    };

    // For loopback the device is an output; its output config describes what
    // it is producing.
    let config = if is_loopback {
        device
            .default_output_config()
            .map_err(|e| CaptureError::Config(format!("Loopback config: {}", e)))?
    } else {
        device
            .default_input_config()
            .map_err(|e| CaptureError::Config(e.to_string()))?
    };

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    buffer.set_sample_rate(sample_rate);

    log::info!("Audio capture: {} Hz, {} channels", sample_rate, channels);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), buffer, channels),
        SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), buffer, channels),
        SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), buffer, channels),
        other => {
            // Unsupported encodings contribute no frames; not fatal per se,
            // but without a stream there is nothing to capture.
            return Err(CaptureError::Config(format!(
                "Unsupported sample format {:?}",
                other
            )));
        }
    }
    .map_err(|e| CaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Play(e.to_string()))?;

    log::info!("Audio capture started");

    // Park until told to stop; the stream callback does all the work.
    match command_rx.recv() {
        Ok(Command::Stop) => log::info!("Audio capture stopping"),
        Err(_) => log::info!("Audio capture channel disconnected"),
    }

    Ok(())
}

/// Build an input stream that downmixes to mono and pushes into the buffer.
fn build_stream<T: cpal::SizedSample>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<CaptureBuffer>,
    channels: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    // Reused across callbacks; the buffer itself never allocates on push.
    let mut mono = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(data.chunks(channels).map(|frame| {
                let sum: f32 = frame
                    .iter()
                    .map(|s| <f32 as cpal::Sample>::from_sample(*s))
                    .sum();
                sum / channels as f32
            }));
            buffer.push_mono(&mono);
        },
        |err| {
            log::error!("Audio stream error: {}", err);
        },
        None,
    )
}
