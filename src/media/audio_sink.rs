//! Remote audio tap: reads RTP from a remote track and forwards codec
//! payloads to the embedder on the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::RtcContext;
use crate::dispatch::{Dispatcher, Dispose, Handle};
use crate::error::{Error, Result};
use crate::media::{MediaStreamTrack, TrackKind, TrackState};

/// One RTP payload from the remote audio track. The payload is still in
/// codec form; decoding is the embedder's business.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub payload: Bytes,
    pub timestamp: u32,
    pub sequence_number: u16,
}

type PacketFn = Arc<dyn Fn(AudioPacket) + Send + Sync>;
type EndedFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_packet: Option<PacketFn>,
    on_ended: Option<EndedFn>,
}

/// Reader attached to a remote audio track, handed out as a [`Handle`].
/// Disposing it detaches from the track exactly once.
pub struct AudioSink {
    track: Arc<MediaStreamTrack>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<Mutex<Handlers>>,
}

impl AudioSink {
    /// Attaches to a live remote audio track and starts reading.
    pub fn attach(context: &RtcContext, track: &Arc<MediaStreamTrack>) -> Result<Handle<Self>> {
        if track.kind() != TrackKind::Audio {
            return Err(Error::new("AudioSink requires an audio track."));
        }
        if track.ready_state() != TrackState::Live {
            return Err(Error::new("AudioSink requires a live track."));
        }
        let Some(remote) = track.remote() else {
            return Err(Error::new("AudioSink requires a remote track."));
        };

        let running = Arc::new(AtomicBool::new(true));
        let handlers: Arc<Mutex<Handlers>> = Arc::new(Mutex::new(Handlers::default()));
        let task = Self::spawn_reader(
            context.dispatcher().clone(),
            context,
            remote.clone(),
            track.clone(),
            running.clone(),
            handlers.clone(),
        );
        debug!(track = track.id(), "audio sink attached");
        Ok(Handle::new(Self {
            track: track.clone(),
            running,
            task: Mutex::new(Some(task)),
            handlers,
        }))
    }

    fn spawn_reader(
        dispatcher: Dispatcher,
        context: &RtcContext,
        remote: Arc<webrtc::track::track_remote::TrackRemote>,
        track: Arc<MediaStreamTrack>,
        running: Arc<AtomicBool>,
        handlers: Arc<Mutex<Handlers>>,
    ) -> JoinHandle<()> {
        context.runtime().spawn(async move {
            loop {
                match remote.read_rtp().await {
                    Ok((packet, _attributes)) => {
                        let handler = handlers.lock().on_packet.clone();
                        if let Some(handler) = handler {
                            let audio = AudioPacket {
                                payload: packet.payload.clone(),
                                timestamp: packet.header.timestamp,
                                sequence_number: packet.header.sequence_number,
                            };
                            dispatcher.call(move || handler(audio));
                        }
                    }
                    Err(_) => {
                        // Track over or transport gone either way.
                        if running.swap(false, Ordering::AcqRel) {
                            track.mark_ended();
                            let handler = handlers.lock().on_ended.clone();
                            if let Some(handler) = handler {
                                dispatcher.call(move || handler());
                            }
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Detaches from the track. Safe to call repeatedly; only the first
    /// call does anything.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(track = self.track.id(), "audio sink detached");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn track(&self) -> Arc<MediaStreamTrack> {
        self.track.clone()
    }

    pub fn on_packet(&self, callback: impl Fn(AudioPacket) + Send + Sync + 'static) {
        self.handlers.lock().on_packet = Some(Arc::new(callback));
    }

    /// Fires once, on the dispatcher, when the remote track ends.
    pub fn on_ended(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().on_ended = Some(Arc::new(callback));
    }
}

impl Dispose for AudioSink {
    fn dispose(&self) {
        self.stop();
    }
}
