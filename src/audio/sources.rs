//! Audio source enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capturable audio source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSourceInfo {
    /// Unique identifier, parsed by [`start_capture`](super::start_capture).
    pub id: String,

    /// Display name
    pub name: String,

    /// Source type
    pub kind: SourceKind,
}

/// Type of audio source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// System-wide audio (loopback on an output device)
    SystemAudio,

    /// Input device (microphone, line in)
    InputDevice,
}

/// Source enumeration errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to enumerate devices: {0}")]
    Enumeration(String),
}

/// List available audio sources: the default loopback first, then named
/// outputs, then inputs.
pub fn list_sources() -> Result<Vec<AudioSourceInfo>, SourceError> {
    let mut sources = Vec::new();
    let host = cpal::default_host();

    let default_output_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    if let Some(name) = &default_output_name {
        sources.push(AudioSourceInfo {
            id: "system_audio".to_string(),
            name: format!("System Audio ({})", name),
            kind: SourceKind::SystemAudio,
        });
    }

    if let Ok(devices) = host.output_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                // The default output is already listed as "System Audio".
                if default_output_name.as_deref() == Some(name.as_str()) {
                    continue;
                }
                sources.push(AudioSourceInfo {
                    id: format!("output:{}", name),
                    name: format!("Loopback: {}", name),
                    kind: SourceKind::SystemAudio,
                });
            }
        }
    }

    match host.input_devices() {
        Ok(devices) => {
            for device in devices {
                if let Ok(name) = device.name() {
                    sources.push(AudioSourceInfo {
                        id: format!("input:{}", name),
                        name: format!("Input: {}", name),
                        kind: SourceKind::InputDevice,
                    });
                }
            }
        }
        Err(e) => log::warn!("Failed to enumerate input devices: {}", e),
    }

    Ok(sources)
}
