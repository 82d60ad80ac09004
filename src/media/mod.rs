//! Media streams and tracks layered over the engine's local and remote
//! track types.

mod audio_sink;
mod audio_source;
mod video_source;

pub use audio_sink::{AudioPacket, AudioSink};
pub use audio_source::{AudioBuffer, AudioSource};
pub use video_source::{VideoFrame, VideoSource};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::context::RtcContext;
use crate::dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Live,
    Ended,
}

pub(crate) enum TrackBacking {
    Remote(Arc<TrackRemote>),
    Local(Arc<TrackLocalStaticSample>),
}

/// One audio or video track, remote (engine-received) or local
/// (source-fed).
pub struct MediaStreamTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    muted: AtomicBool,
    ended: AtomicBool,
    backing: TrackBacking,
}

impl MediaStreamTrack {
    pub(crate) fn from_remote(track: Arc<TrackRemote>) -> Arc<Self> {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Arc::new(Self {
            id: track.id(),
            kind,
            enabled: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            backing: TrackBacking::Remote(track),
        })
    }

    pub(crate) fn from_local(track: Arc<TrackLocalStaticSample>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: track.id().to_string(),
            kind,
            enabled: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            backing: TrackBacking::Local(track),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backing, TrackBacking::Remote(_))
    }

    pub fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::Acquire) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    pub(crate) fn remote(&self) -> Option<&Arc<TrackRemote>> {
        match &self.backing {
            TrackBacking::Remote(track) => Some(track),
            TrackBacking::Local(_) => None,
        }
    }

    pub(crate) fn local(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        match &self.backing {
            TrackBacking::Local(track) => Some(track),
            TrackBacking::Remote(_) => None,
        }
    }
}

type TrackCallback = Arc<dyn Fn(Arc<MediaStreamTrack>) + Send + Sync>;

#[derive(Default)]
struct StreamHandlers {
    on_add_track: Option<TrackCallback>,
    on_remove_track: Option<TrackCallback>,
}

/// A named group of tracks. Track membership changes are announced on the
/// dispatcher through `on_add_track`/`on_remove_track`.
pub struct MediaStream {
    id: String,
    dispatcher: Dispatcher,
    tracks: Mutex<Vec<Arc<MediaStreamTrack>>>,
    handlers: Mutex<StreamHandlers>,
}

impl MediaStream {
    pub fn new(context: &RtcContext) -> Arc<Self> {
        Self::with_id(context.dispatcher().clone(), Uuid::new_v4().to_string())
    }

    pub(crate) fn with_id(dispatcher: Dispatcher, id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            dispatcher,
            tracks: Mutex::new(Vec::new()),
            handlers: Mutex::new(StreamHandlers::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a track, announcing it through `on_add_track`. Adding a track
    /// that is already a member is a no-op.
    pub fn add_track(&self, track: Arc<MediaStreamTrack>) {
        {
            let mut tracks = self.tracks.lock();
            if tracks.iter().any(|t| t.id() == track.id()) {
                return;
            }
            tracks.push(track.clone());
        }
        debug!(stream = %self.id, track = track.id(), "track added");
        let handler = self.handlers.lock().on_add_track.clone();
        if let Some(handler) = handler {
            self.dispatcher.call(move || handler(track));
        }
    }

    /// Removes a track by id, announcing it through `on_remove_track`.
    pub fn remove_track(&self, track_id: &str) {
        let removed = {
            let mut tracks = self.tracks.lock();
            tracks
                .iter()
                .position(|t| t.id() == track_id)
                .map(|index| tracks.remove(index))
        };
        if let Some(track) = removed {
            debug!(stream = %self.id, track = track.id(), "track removed");
            let handler = self.handlers.lock().on_remove_track.clone();
            if let Some(handler) = handler {
                self.dispatcher.call(move || handler(track));
            }
        }
    }

    pub fn track_by_id(&self, track_id: &str) -> Option<Arc<MediaStreamTrack>> {
        self.tracks.lock().iter().find(|t| t.id() == track_id).cloned()
    }

    pub fn tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks.lock().clone()
    }

    pub fn audio_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks
            .lock()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn on_add_track(&self, callback: impl Fn(Arc<MediaStreamTrack>) + Send + Sync + 'static) {
        self.handlers.lock().on_add_track = Some(Arc::new(callback));
    }

    pub fn on_remove_track(
        &self,
        callback: impl Fn(Arc<MediaStreamTrack>) + Send + Sync + 'static,
    ) {
        self.handlers.lock().on_remove_track = Some(Arc::new(callback));
    }
}
