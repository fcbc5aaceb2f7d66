use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::errors::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A platform media track. Implemented by the host's capture layer.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    /// Capture device backing this track, if the platform reports one.
    fn device_id(&self) -> Option<String>;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

pub type TrackHandle = Arc<dyn MediaTrack>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSelector {
    /// Portable capability hint (`facingMode`).
    Facing(Facing),
    /// Explicit capture device.
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoSelector>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoSelector::Facing(Facing::User)),
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    /// Human-readable; never used for selection.
    pub label: String,
    pub facing: Option<Facing>,
}

/// Device acquisition capability provided by the platform.
///
/// Failures must be reported as [`StageError::PermissionDenied`] or
/// [`StageError::DeviceUnavailable`].
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<TrackHandle>, StageError>;

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, StageError>;
}

/// Pick a front camera only when exactly one video input reports facing the user.
pub fn select_front_camera(devices: &[DeviceInfo]) -> Option<String> {
    let mut front = devices
        .iter()
        .filter(|d| d.kind == DeviceKind::VideoInput && d.facing == Some(Facing::User));
    match (front.next(), front.next()) {
        (Some(device), None) => Some(device.device_id.clone()),
        _ => None,
    }
}

/// The flow that currently holds local media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOwner {
    Room(String),
    Call(String),
}

impl fmt::Display for MediaOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room {id}"),
            Self::Call(peer) => write!(f, "call with {peer}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub tracks: Vec<TrackHandle>,
    pub muted: bool,
    pub camera_enabled: bool,
    pub device_id: Option<String>,
}

impl LocalMediaState {
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Acquiring {
        owner: MediaOwner,
        ticket: u64,
    },
    Held {
        owner: MediaOwner,
        media: LocalMediaState,
    },
}

#[derive(Debug, Default)]
struct Inner {
    slot: Slot,
    next_ticket: u64,
    muted: bool,
    camera_enabled: bool,
}

/// Acquires and releases the local camera/microphone.
///
/// Only one flow may hold media at a time. A second acquisition by the same
/// owner reuses the held tracks; any other owner is rejected with
/// [`StageError::MediaBusy`].
#[derive(Clone)]
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    inner: Arc<Mutex<Inner>>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            inner: Arc::new(Mutex::new(Inner {
                camera_enabled: true,
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(
        &self,
        owner: MediaOwner,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaState, StageError> {
        let ticket = {
            let mut inner = self.lock();
            match &inner.slot {
                Slot::Held { owner: held, media } if *held == owner => {
                    tracing::debug!("reusing local media for {owner}");
                    return Ok(media.clone());
                }
                Slot::Held { owner: held, .. } | Slot::Acquiring { owner: held, .. } => {
                    return Err(StageError::MediaBusy(held.to_string()));
                }
                Slot::Empty => {}
            }
            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            inner.slot = Slot::Acquiring {
                owner: owner.clone(),
                ticket,
            };
            ticket
        };

        tracing::info!("acquiring local media for {owner}");
        let result = self.open(constraints).await;

        let mut inner = self.lock();
        let still_wanted =
            matches!(&inner.slot, Slot::Acquiring { ticket: t, .. } if *t == ticket);
        match result {
            Err(e) => {
                if still_wanted {
                    inner.slot = Slot::Empty;
                }
                tracing::warn!("local media acquisition failed: {e}");
                Err(e)
            }
            Ok(tracks) if !still_wanted => {
                tracing::info!("local media released during acquisition, stopping tracks");
                tracks.iter().for_each(|t| t.stop());
                Err(StageError::Cancelled(format!("media for {owner}")))
            }
            Ok(tracks) => {
                for track in &tracks {
                    match track.kind() {
                        TrackKind::Audio => track.set_enabled(!inner.muted),
                        TrackKind::Video => track.set_enabled(inner.camera_enabled),
                    }
                }
                let device_id = tracks
                    .iter()
                    .find(|t| t.kind() == TrackKind::Video)
                    .and_then(|t| t.device_id());
                let media = LocalMediaState {
                    tracks,
                    muted: inner.muted,
                    camera_enabled: inner.camera_enabled,
                    device_id,
                };
                inner.slot = Slot::Held {
                    owner,
                    media: media.clone(),
                };
                Ok(media)
            }
        }
    }

    /// Facing hint first; explicit device only if one front camera is reported.
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<TrackHandle>, StageError> {
        let err = match self.devices.get_user_media(constraints).await {
            Ok(tracks) => return Ok(tracks),
            Err(e) => e,
        };
        let (StageError::DeviceUnavailable(_), Some(VideoSelector::Facing(Facing::User))) =
            (&err, &constraints.video)
        else {
            return Err(err);
        };

        let devices = match self.devices.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::debug!("device enumeration failed: {e}");
                return Err(err);
            }
        };
        let Some(device_id) = select_front_camera(&devices) else {
            return Err(err);
        };
        tracing::info!(device_id, "retrying with front-facing device");
        let explicit = MediaConstraints {
            video: Some(VideoSelector::Device(device_id)),
            ..constraints.clone()
        };
        self.devices.get_user_media(&explicit).await
    }

    /// Stop every track and clear the held stream. No-op when nothing is held.
    pub fn release(&self) {
        let slot = std::mem::take(&mut self.lock().slot);
        Self::stop_slot(slot);
    }

    /// Release only if `owner` holds (or is acquiring) the media.
    pub fn release_for(&self, owner: &MediaOwner) -> bool {
        let slot = {
            let mut inner = self.lock();
            let owned = match &inner.slot {
                Slot::Held { owner: held, .. } | Slot::Acquiring { owner: held, .. } => {
                    held == owner
                }
                Slot::Empty => false,
            };
            if !owned {
                return false;
            }
            std::mem::take(&mut inner.slot)
        };
        Self::stop_slot(slot);
        true
    }

    fn stop_slot(slot: Slot) {
        match slot {
            Slot::Held { owner, media } => {
                media.tracks.iter().for_each(|t| t.stop());
                tracing::info!("local media released by {owner}");
            }
            Slot::Acquiring { owner, .. } => {
                tracing::info!("pending media acquisition for {owner} cancelled");
            }
            Slot::Empty => {}
        }
    }

    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.lock();
        inner.muted = muted;
        if let Slot::Held { media, .. } = &mut inner.slot {
            media.muted = muted;
            media
                .tracks
                .iter()
                .filter(|t| t.kind() == TrackKind::Audio)
                .for_each(|t| t.set_enabled(!muted));
        }
        tracing::info!("microphone muted: {muted}");
    }

    pub fn set_camera_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        inner.camera_enabled = enabled;
        if let Slot::Held { media, .. } = &mut inner.slot {
            media.camera_enabled = enabled;
            media
                .tracks
                .iter()
                .filter(|t| t.kind() == TrackKind::Video)
                .for_each(|t| t.set_enabled(enabled));
        }
        tracing::info!("camera enabled: {enabled}");
    }

    pub fn state(&self) -> Option<LocalMediaState> {
        match &self.lock().slot {
            Slot::Held { media, .. } => Some(media.clone()),
            _ => None,
        }
    }

    pub fn owner(&self) -> Option<MediaOwner> {
        match &self.lock().slot {
            Slot::Held { owner, .. } | Slot::Acquiring { owner, .. } => Some(owner.clone()),
            Slot::Empty => None,
        }
    }

    pub fn tracks(&self) -> Vec<TrackHandle> {
        self.state().map(|m| m.tracks).unwrap_or_default()
    }
}
