//! Local media ownership and the capture/render collaborators.
//!
//! The session manager exclusively owns the [`LocalMediaStream`]. It lends
//! tracks to the peer link and the stream to the renderer, and stops every
//! track on hangup.

use crate::error::CaptureError;
use crate::link::RemoteTrack;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDevice {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Ask for video if any camera exists and audio if any microphone exists.
    pub fn from_devices(devices: &[MediaDevice]) -> Self {
        Self {
            audio: devices.iter().any(|d| d.kind == DeviceKind::AudioInput),
            video: devices.iter().any(|d| d.kind == DeviceKind::VideoInput),
        }
    }
}

#[derive(Debug)]
struct TrackState {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Handle to one captured track. Clones share the same underlying track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    state: Arc<TrackState>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self::with_id(kind, Uuid::new_v4().to_string())
    }

    pub fn with_id(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(TrackState {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn kind(&self) -> TrackKind {
        self.state.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire)
    }

    /// Mute/unmute without releasing the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire)
    }

    /// Release the device. A stopped track never becomes live again.
    pub fn stop(&self) {
        self.state.live.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Microphone toggle.
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_tracks().for_each(|t| t.set_enabled(enabled));
    }

    /// Camera toggle.
    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_tracks().for_each(|t| t.set_enabled(enabled));
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    pub fn stop(&self) {
        self.tracks.iter().for_each(LocalTrack::stop);
    }
}

/// Capture collaborator ("give me a local media stream").
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CaptureError>;

    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMediaStream, CaptureError>;
}

/// Render collaborator ("show this stream").
pub trait MediaRenderer: Send + Sync {
    fn render_local(&self, stream: &LocalMediaStream);

    fn render_remote(&self, track: &RemoteTrack);
}

/// Capture local media, falling back to audio-only once if the camera cannot start.
pub async fn acquire_local_media(capture: &dyn MediaCapture) -> Result<LocalMediaStream, CaptureError> {
    let devices = capture.enumerate_devices().await?;
    let mut constraints = MediaConstraints::from_devices(&devices);

    tracing::debug!(
        audio = constraints.audio,
        video = constraints.video,
        devices = devices.len(),
        "Capturing local media"
    );

    match capture.capture(constraints).await {
        Err(CaptureError::VideoSourceUnavailable) if constraints.video => {
            tracing::warn!("Video source unavailable, retrying with audio only");
            constraints.video = false;
            capture.capture(constraints).await
        }
        other => other,
    }
}

/// Capture stand-in for headless participants: pretends the requested devices exist.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    pub audio: bool,
    pub video: bool,
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CaptureError> {
        let mut devices = Vec::new();
        if self.audio {
            devices.push(MediaDevice {
                id: "synthetic-mic".into(),
                kind: DeviceKind::AudioInput,
                label: "Synthetic microphone".into(),
            });
        }
        if self.video {
            devices.push(MediaDevice {
                id: "synthetic-cam".into(),
                kind: DeviceKind::VideoInput,
                label: "Synthetic camera".into(),
            });
        }
        Ok(devices)
    }

    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMediaStream, CaptureError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video));
        }
        Ok(LocalMediaStream::new(tracks))
    }
}

/// Renderer that only logs what it would show.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRenderer;

impl MediaRenderer for LogRenderer {
    fn render_local(&self, stream: &LocalMediaStream) {
        tracing::info!(
            stream = %stream.id(),
            tracks = stream.tracks().len(),
            "Rendering local stream"
        );
    }

    fn render_remote(&self, track: &RemoteTrack) {
        tracing::info!(track = %track.id, kind = ?track.kind, "Rendering remote track");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Capture that fails with a scripted sequence of errors before succeeding.
    struct ScriptedCapture {
        devices: Vec<MediaDevice>,
        failures: Mutex<Vec<CaptureError>>,
        requests: Mutex<Vec<MediaConstraints>>,
    }

    impl ScriptedCapture {
        fn new(devices: Vec<MediaDevice>, mut failures: Vec<CaptureError>) -> Self {
            failures.reverse();
            Self {
                devices,
                failures: Mutex::new(failures),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaCapture for ScriptedCapture {
        async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CaptureError> {
            Ok(self.devices.clone())
        }

        async fn capture(
            &self,
            constraints: MediaConstraints,
        ) -> Result<LocalMediaStream, CaptureError> {
            self.requests.lock().unwrap().push(constraints);
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            SyntheticCapture::default().capture(constraints).await
        }
    }

    fn device(kind: DeviceKind) -> MediaDevice {
        MediaDevice {
            id: format!("{kind:?}"),
            kind,
            label: String::new(),
        }
    }

    fn cam_and_mic() -> Vec<MediaDevice> {
        vec![device(DeviceKind::VideoInput), device(DeviceKind::AudioInput)]
    }

    #[test]
    fn test_constraints_follow_devices() {
        let c = MediaConstraints::from_devices(&[device(DeviceKind::AudioInput)]);
        assert_eq!(c, MediaConstraints { audio: true, video: false });

        let c = MediaConstraints::from_devices(&[device(DeviceKind::AudioOutput)]);
        assert_eq!(c, MediaConstraints::default());
    }

    #[tokio::test]
    async fn test_video_failure_falls_back_to_audio_once() {
        let capture = ScriptedCapture::new(cam_and_mic(), vec![CaptureError::VideoSourceUnavailable]);

        let stream = acquire_local_media(&capture).await.unwrap();

        assert_eq!(stream.video_tracks().count(), 0);
        assert_eq!(stream.audio_tracks().count(), 1);
        let requests = capture.requests.lock().unwrap();
        assert_eq!(
            *requests,
            vec![
                MediaConstraints { audio: true, video: true },
                MediaConstraints { audio: true, video: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_fallback_is_attempted_only_once() {
        let capture = ScriptedCapture::new(
            cam_and_mic(),
            vec![
                CaptureError::VideoSourceUnavailable,
                CaptureError::Device("microphone busy".into()),
            ],
        );

        let err = acquire_local_media(&capture).await.unwrap_err();

        assert_eq!(err, CaptureError::Device("microphone busy".into()));
        assert_eq!(capture.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_do_not_fall_back() {
        let capture = ScriptedCapture::new(cam_and_mic(), vec![CaptureError::PermissionDenied]);

        let err = acquire_local_media(&capture).await.unwrap_err();

        assert_eq!(err, CaptureError::PermissionDenied);
        assert_eq!(capture.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_toggles_and_stop() {
        let stream = LocalMediaStream::new(vec![
            LocalTrack::new(TrackKind::Audio),
            LocalTrack::new(TrackKind::Video),
        ]);
        let lent = stream.tracks()[1].clone();

        stream.set_video_enabled(false);
        assert!(!lent.is_enabled());
        assert!(stream.audio_tracks().all(LocalTrack::is_enabled));

        stream.stop();
        assert!(!lent.is_live());
        assert!(!stream.is_active());
    }
}
