//! Local audio track fed from a buffer queue, paced at a fixed 10 ms
//! tick. Same queue discipline as the video source: teardown errors every
//! queued buffer instead of dropping it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime;
use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::context::RtcContext;
use crate::dispatch::{Dispatcher, Dispose, Handle};
use crate::error::Error;
use crate::media::{MediaStreamTrack, TrackKind};

const SOURCE_ENDED: &str = "AudioSource ended.";
const TICK_MS: i64 = 10;

/// A block of encoded audio covering `frames` samples per channel.
pub struct AudioBuffer {
    pub data: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u32,
}

impl AudioBuffer {
    fn duration(&self) -> Duration {
        let rate = self.sample_rate.max(1);
        Duration::from_micros(u64::from(self.frames) * 1_000_000 / u64::from(rate))
    }
}

type DoneFn = Box<dyn FnOnce(Option<Error>) + Send>;
type DrainFn = Arc<dyn Fn() + Send + Sync>;

struct QueuedBuffer {
    buffer: AudioBuffer,
    done: Option<DoneFn>,
}

struct Shared {
    track: Arc<TrackLocalStaticSample>,
    queue: Mutex<VecDeque<QueuedBuffer>>,
    running: AtomicBool,
    drain_needed: AtomicBool,
    on_drain: Mutex<Option<DrainFn>>,
    dispatcher: Dispatcher,
    runtime: runtime::Handle,
}

impl Shared {
    fn schedule_tick(self: &Arc<Self>) {
        // No re-arm on a stopped dispatcher; the inline execution there
        // would never terminate.
        if !self.dispatcher.is_running() {
            return;
        }
        let shared = self.clone();
        self.dispatcher.set_timeout(move || shared.tick(), TICK_MS);
    }

    fn tick(self: Arc<Self>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let next = self.queue.lock().pop_front();
        match next {
            Some(QueuedBuffer { buffer, done }) => {
                self.drain_needed.store(true, Ordering::Release);
                let track = self.track.clone();
                let dispatcher = self.dispatcher.clone();
                let duration = buffer.duration();
                self.runtime.spawn(async move {
                    let sample = Sample {
                        data: buffer.data,
                        duration,
                        ..Default::default()
                    };
                    let outcome = track
                        .write_sample(&sample)
                        .await
                        .err()
                        .map(|e| Error::new(format!("Failed to write audio: {e}")));
                    if let Some(done) = done {
                        dispatcher.call(move || done(outcome));
                    }
                });
            }
            None => {
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

/// A paced local audio source, handed out as a [`Handle`].
pub struct AudioSource {
    shared: Arc<Shared>,
    track: Arc<MediaStreamTrack>,
}

impl AudioSource {
    pub fn new(context: &RtcContext) -> Handle<Self> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{}", Uuid::new_v4()),
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
        });
        shared.schedule_tick();
        debug!("audio source started");
        Handle::new(Self {
            shared,
            track: MediaStreamTrack::from_local(track, TrackKind::Audio),
        })
    }

    /// Queues an audio buffer; `done` reports delivery or failure on the
    /// dispatcher.
    pub fn write(&self, buffer: AudioBuffer, done: impl FnOnce(Option<Error>) + Send + 'static) {
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.queue.lock().push_back(QueuedBuffer {
                buffer,
                done: Some(Box::new(done)),
            });
        } else {
            self.shared
                .dispatcher
                .call(move || done(Some(Error::new(SOURCE_ENDED))));
        }
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.track.mark_ended();
        let drained: Vec<QueuedBuffer> = self.shared.queue.lock().drain(..).collect();
        debug!(dropped = drained.len(), "audio source stopped");
        for queued in drained {
            if let Some(done) = queued.done {
                self.shared
                    .dispatcher
                    .call(move || done(Some(Error::new(SOURCE_ENDED))));
            }
        }
    }

    pub fn on_drain(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_drain.lock() = Some(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn track(&self) -> Arc<MediaStreamTrack> {
        self.track.clone()
    }
}

impl Dispose for AudioSource {
    fn dispose(&self) {
        self.stop();
    }
}
