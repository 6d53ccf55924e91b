//! System capture devices.
//!
//! Probes the default microphone (cpal, `audio` feature) and the first V4L2
//! camera (`video-capture` feature) so permission and availability problems
//! surface as [`MediaAccessError`]s before a call starts. Screen capture is
//! not available from a terminal.

use async_trait::async_trait;

use super::error::{DeviceKind, MediaAccessError};
use super::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind, TrackSource};

/// Devices backed by the host's audio and video subsystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

#[cfg(feature = "audio")]
fn probe_microphone() -> Result<String, MediaAccessError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaAccessError::DeviceMissing(DeviceKind::Microphone))?;
    let name = device.name().unwrap_or_else(|_| "Default microphone".into());
    match device.default_input_config() {
        Ok(config) => {
            tracing::debug!(
                "Microphone '{}': {} Hz, {} ch",
                name,
                config.sample_rate().0,
                config.channels()
            );
            Ok(name)
        }
        Err(cpal::DefaultStreamConfigError::DeviceNotAvailable) => {
            Err(MediaAccessError::DeviceBusy(DeviceKind::Microphone))
        }
        Err(e) => {
            tracing::warn!("Microphone '{}' unusable: {}", name, e);
            Err(MediaAccessError::DeviceMissing(DeviceKind::Microphone))
        }
    }
}

#[cfg(not(feature = "audio"))]
fn probe_microphone() -> Result<String, MediaAccessError> {
    Ok("Default microphone".into())
}

#[cfg(feature = "video-capture")]
fn probe_camera() -> Result<String, MediaAccessError> {
    const EBUSY: i32 = 16;

    let dev = v4l::Device::new(0).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MediaAccessError::DeviceMissing(DeviceKind::Camera),
        std::io::ErrorKind::PermissionDenied => {
            MediaAccessError::PermissionDenied(DeviceKind::Camera)
        }
        _ if e.raw_os_error() == Some(EBUSY) => MediaAccessError::DeviceBusy(DeviceKind::Camera),
        _ => {
            tracing::warn!("Camera open failed: {}", e);
            MediaAccessError::DeviceMissing(DeviceKind::Camera)
        }
    })?;
    let label = dev
        .query_caps()
        .map(|caps| caps.card)
        .unwrap_or_else(|_| "/dev/video0".into());
    tracing::debug!("Camera '{}' available", label);
    Ok(label)
}

#[cfg(not(feature = "video-capture"))]
fn probe_camera() -> Result<String, MediaAccessError> {
    Err(MediaAccessError::DeviceMissing(DeviceKind::Camera))
}

fn probe(constraints: MediaConstraints) -> Result<MediaStream, MediaAccessError> {
    let mut tracks = Vec::new();
    if constraints.audio {
        let label = probe_microphone()?;
        tracks.push(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, label));
    }
    if constraints.video {
        let label = match probe_camera() {
            Ok(label) => label,
            Err(e) => {
                for t in &tracks {
                    t.stop();
                }
                return Err(e);
            }
        };
        tracks.push(MediaTrack::new(TrackKind::Video, TrackSource::Camera, label));
    }
    Ok(MediaStream::new(tracks))
}

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        tokio::task::spawn_blocking(move || probe(constraints))
            .await
            .unwrap_or(Err(MediaAccessError::DeviceBusy(DeviceKind::Microphone)))
    }

    async fn get_display_media(&self) -> Result<MediaTrack, MediaAccessError> {
        Err(MediaAccessError::DeviceMissing(DeviceKind::Screen))
    }
}
