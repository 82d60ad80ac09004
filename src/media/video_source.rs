//! Local video track fed from a frame queue.
//!
//! Frames are queued by the embedder and drained by a dispatcher-paced
//! pump at the configured rate, one frame per tick. Teardown never drops
//! queued frames silently: each one's completion callback fires with the
//! terminal error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime;
use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::context::RtcContext;
use crate::dispatch::{Dispatcher, Dispose, Handle};
use crate::error::Error;
use crate::media::{MediaStreamTrack, TrackKind};

const SOURCE_ENDED: &str = "VideoSource ended.";

/// One encoded video frame and its presentation duration.
pub struct VideoFrame {
    pub data: Bytes,
    pub duration: Duration,
}

type DoneFn = Box<dyn FnOnce(Option<Error>) + Send>;
type DrainFn = Arc<dyn Fn() + Send + Sync>;

struct QueuedFrame {
    frame: VideoFrame,
    done: Option<DoneFn>,
}

struct Shared {
    track: Arc<TrackLocalStaticSample>,
    queue: Mutex<VecDeque<QueuedFrame>>,
    running: AtomicBool,
    drain_needed: AtomicBool,
    on_drain: Mutex<Option<DrainFn>>,
    dispatcher: Dispatcher,
    runtime: runtime::Handle,
    interval_ms: i64,
}

impl Shared {
    fn schedule_tick(self: &Arc<Self>) {
        // Once the dispatcher stops, scheduled entries run inline on the
        // scheduling thread; a re-arm there would never terminate.
        if !self.dispatcher.is_running() {
            return;
        }
        let shared = self.clone();
        self.dispatcher
            .set_timeout(move || shared.tick(), self.interval_ms);
    }

    fn tick(self: Arc<Self>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let next = self.queue.lock().pop_front();
        match next {
            Some(QueuedFrame { frame, done }) => {
                self.drain_needed.store(true, Ordering::Release);
                let track = self.track.clone();
                let dispatcher = self.dispatcher.clone();
                self.runtime.spawn(async move {
                    let sample = Sample {
                        data: frame.data,
                        duration: frame.duration,
                        ..Default::default()
                    };
                    let outcome = track
                        .write_sample(&sample)
                        .await
                        .err()
                        .map(|e| Error::new(format!("Failed to write frame: {e}")));
                    if let Some(done) = done {
                        dispatcher.call(move || done(outcome));
                    }
                });
            }
            None => {
                // Queue went empty after having carried frames.
                if self.drain_needed.swap(false, Ordering::AcqRel) {
                    let handler = self.on_drain.lock().clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
            }
        }
        self.schedule_tick();
    }
}

/// A paced local video source. Handed out as a [`Handle`]; disposing it
/// stops the pump and errors the queued frames.
pub struct VideoSource {
    shared: Arc<Shared>,
    track: Arc<MediaStreamTrack>,
    width: u32,
    height: u32,
    fps: u32,
}

impl VideoSource {
    pub fn new(context: &RtcContext, width: u32, height: u32, fps: u32) -> Handle<Self> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", Uuid::new_v4()),
            format!("stream-{}", Uuid::new_v4()),
        ));
        let shared = Arc::new(Shared {
            track: track.clone(),
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            drain_needed: AtomicBool::new(false),
            on_drain: Mutex::new(None),
            dispatcher: context.dispatcher().clone(),
            runtime: context.runtime(),
            interval_ms: 1000 / i64::from(fps.max(1)),
        });
        shared.schedule_tick();
        debug!(width, height, fps, "video source started");
        Handle::new(Self {
            shared,
            track: MediaStreamTrack::from_local(track, TrackKind::Video),
            width,
            height,
            fps,
        })
    }

    /// Queues a frame. `done` fires on the dispatcher with `None` once the
    /// frame reaches the engine, or with the failure; after
    /// [`VideoSource::stop`] it fires immediately with the terminal error.
    pub fn write(&self, frame: VideoFrame, done: impl FnOnce(Option<Error>) + Send + 'static) {
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.queue.lock().push_back(QueuedFrame {
                frame,
                done: Some(Box::new(done)),
            });
        } else {
            self.shared
                .dispatcher
                .call(move || done(Some(Error::new(SOURCE_ENDED))));
        }
    }

    /// Stops the pump. Every queued frame's `done` callback fires with the
    /// terminal error.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.track.mark_ended();
        let drained: Vec<QueuedFrame> = self.shared.queue.lock().drain(..).collect();
        debug!(dropped = drained.len(), "video source stopped");
        for queued in drained {
            if let Some(done) = queued.done {
                self.shared
                    .dispatcher
                    .call(move || done(Some(Error::new(SOURCE_ENDED))));
            }
        }
    }

    /// Fires on the dispatcher when the frame queue empties after having
    /// carried frames.
    pub fn on_drain(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_drain.lock() = Some(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// The track to place in a [`crate::media::MediaStream`] for sending.
    pub fn track(&self) -> Arc<MediaStreamTrack> {
        self.track.clone()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Dispose for VideoSource {
    fn dispose(&self) {
        self.stop();
    }
}
