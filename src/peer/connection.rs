//! The peer connection facade.
//!
//! Every potentially long-running operation returns a [`Promise`]; the
//! engine future runs on the context runtime and settles the promise,
//! which delivers on the dispatcher. Engine events are likewise queued on
//! the dispatcher before user callbacks run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::channels::{DataChannelInit, RtcDataChannel};
use crate::config::RtcConfiguration;
use crate::context::RtcContext;
use crate::dispatch::{Dispatcher, Promise, Rejecter, Resolver};
use crate::error::{Error, Result};
use crate::media::{MediaStream, MediaStreamTrack};
use crate::peer::{
    IceCandidate, IceConnectionState, IceGatheringState, SessionDescription, SignalingState,
};

const NO_REMOTE_DESCRIPTION: &str =
    "ICE candidates can't be added without any remote session description.";
const CANDIDATE_UNUSABLE: &str = "Candidate cannot be used.";
const CONNECTION_ENDED: &str = "RTCPeerConnection ended.";

type VoidFn = Arc<dyn Fn() + Send + Sync>;
type CandidateFn = Arc<dyn Fn(IceCandidate) + Send + Sync>;
type SignalingFn = Arc<dyn Fn(SignalingState) + Send + Sync>;
type IceConnectionFn = Arc<dyn Fn(IceConnectionState) + Send + Sync>;
type IceGatheringFn = Arc<dyn Fn(IceGatheringState) + Send + Sync>;
type StreamFn = Arc<dyn Fn(Arc<MediaStream>) + Send + Sync>;
type ChannelFn = Arc<dyn Fn(Arc<RtcDataChannel>) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    negotiation_needed: Option<VoidFn>,
    signaling_state_change: Option<SignalingFn>,
    ice_connection_state_change: Option<IceConnectionFn>,
    ice_gathering_state_change: Option<IceGatheringFn>,
    ice_candidate: Option<CandidateFn>,
    ice_candidates_removed: Option<VoidFn>,
    data_channel: Option<ChannelFn>,
    add_stream: Option<StreamFn>,
    remove_stream: Option<StreamFn>,
}

/// A candidate that arrived before any remote description, parked with its
/// promise until `set_remote_description` succeeds.
struct ParkedCandidate {
    candidate: IceCandidate,
    resolver: Resolver<()>,
    rejecter: Rejecter<()>,
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    dispatcher: Dispatcher,
    runtime: runtime::Handle,
    closed: AtomicBool,
    handlers: Arc<Mutex<Handlers>>,
    parked_candidates: Arc<Mutex<Vec<ParkedCandidate>>>,
    has_remote_description: Arc<AtomicBool>,
    remote_streams: Arc<Mutex<Vec<Arc<MediaStream>>>>,
    local_streams: Mutex<Vec<Arc<MediaStream>>>,
    senders: Mutex<Vec<(String, Arc<RTCRtpSender>)>>,
}

impl RtcPeerConnection {
    pub fn new(context: &RtcContext, config: &RtcConfiguration) -> Result<Arc<Self>> {
        let runtime = context.runtime();
        let engine_config = config.into();
        let api = context.api();
        let pc = runtime
            .block_on(api.new_peer_connection(engine_config))
            .map_err(|e| Error::new(format!("Failed to create peer connection: {e}")))?;
        let connection = Arc::new(Self {
            pc: Arc::new(pc),
            dispatcher: context.dispatcher().clone(),
            runtime,
            closed: AtomicBool::new(false),
            handlers: Arc::new(Mutex::new(Handlers::default())),
            parked_candidates: Arc::new(Mutex::new(Vec::new())),
            has_remote_description: Arc::new(AtomicBool::new(false)),
            remote_streams: Arc::new(Mutex::new(Vec::new())),
            local_streams: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        });
        connection.install_engine_handlers();
        info!("peer connection created");
        Ok(connection)
    }

    // Engine callbacks capture the shared field Arcs, never the facade
    // itself, so the engine's closure storage cannot keep it alive.
    fn install_engine_handlers(&self) {
        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.pc.on_ice_candidate(Box::new(
            move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match IceCandidate::from_engine(&candidate) {
                        Ok(candidate) => {
                            let handler = handlers.lock().ice_candidate.clone();
                            if let Some(handler) = handler {
                                dispatcher.call(move || handler(candidate));
                            }
                        }
                        Err(e) => warn!("dropping unserializable candidate: {e}"),
                    }
                }
                Box::pin(async {})
            },
        ));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.pc.on_signaling_state_change(Box::new(move |state| {
            let handler = handlers.lock().signaling_state_change.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler(state.into()));
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.pc.on_ice_connection_state_change(Box::new(move |state| {
            let handler = handlers.lock().ice_connection_state_change.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler(state.into()));
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            let handler = handlers.lock().ice_gathering_state_change.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler(state.into()));
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let handler = handlers.lock().negotiation_needed.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler());
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        let runtime = self.runtime.clone();
        self.pc.on_data_channel(Box::new(move |engine_channel| {
            debug!(label = engine_channel.label(), "remote data channel announced");
            let channel = RtcDataChannel::wrap(engine_channel, dispatcher.clone(), runtime.clone());
            let handler = handlers.lock().data_channel.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler(channel));
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        let remote_streams = self.remote_streams.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let stream_id = track.stream_id().to_string();
            let wrapped = MediaStreamTrack::from_remote(track);
            debug!(stream = %stream_id, track = wrapped.id(), "remote track arrived");
            let (stream, is_new) = {
                let mut streams = remote_streams.lock();
                match streams.iter().find(|s| s.id() == stream_id) {
                    Some(stream) => (stream.clone(), false),
                    None => {
                        let stream = MediaStream::with_id(dispatcher.clone(), stream_id);
                        streams.push(stream.clone());
                        (stream, true)
                    }
                }
            };
            stream.add_track(wrapped);
            if is_new {
                let handler = handlers.lock().add_stream.clone();
                if let Some(handler) = handler {
                    dispatcher.call(move || handler(stream));
                }
            }
            Box::pin(async {})
        }));
    }

    fn rejected<T: Clone + Send + 'static>(&self, message: &str) -> Promise<T> {
        let error = Error::new(message);
        Promise::new(&self.dispatcher, move |_, rejecter| rejecter.reject(error))
    }

    /// Starts offer creation. The promise fulfills with the offer or
    /// rejects with the engine failure.
    pub fn create_offer(&self) -> Promise<SessionDescription> {
        if self.closed.load(Ordering::Acquire) {
            return self.rejected(CONNECTION_ENDED);
        }
        let pc = self.pc.clone();
        let runtime = self.runtime.clone();
        Promise::new(&self.dispatcher, move |resolver, rejecter| {
            runtime.spawn(async move {
                match pc.create_offer(None).await {
                    Ok(desc) => match SessionDescription::from_engine(&desc) {
                        Some(desc) => resolver.resolve(desc),
                        None => rejecter.reject(Error::new("Engine produced an unusable offer.")),
                    },
                    Err(e) => rejecter.reject(Error::new(format!("Failed to create offer: {e}"))),
                }
            });
        })
    }

    pub fn create_answer(&self) -> Promise<SessionDescription> {
        if self.closed.load(Ordering::Acquire) {
            return self.rejected(CONNECTION_ENDED);
        }
        let pc = self.pc.clone();
        let runtime = self.runtime.clone();
        Promise::new(&self.dispatcher, move |resolver, rejecter| {
            runtime.spawn(async move {
                match pc.create_answer(None).await {
                    Ok(desc) => match SessionDescription::from_engine(&desc) {
                        Some(desc) => resolver.resolve(desc),
                        None => rejecter.reject(Error::new("Engine produced an unusable answer.")),
                    },
                    Err(e) => rejecter.reject(Error::new(format!("Failed to create answer: {e}"))),
                }
            });
        })
    }

    pub fn set_local_description(&self, desc: &SessionDescription) -> Promise<()> {
        if self.closed.load(Ordering::Acquire) {
            return self.rejected(CONNECTION_ENDED);
        }
        let engine_desc = match desc.to_engine() {
            Ok(desc) => desc,
            Err(e) => {
                return Promise::new(&self.dispatcher, move |_, rejecter| rejecter.reject(e))
            }
        };
        let pc = self.pc.clone();
        let runtime = self.runtime.clone();
        Promise::new(&self.dispatcher, move |resolver, rejecter| {
            runtime.spawn(async move {
                match pc.set_local_description(engine_desc).await {
                    Ok(()) => resolver.resolve(()),
                    Err(e) => rejecter
                        .reject(Error::new(format!("Failed to set local description: {e}"))),
                }
            });
        })
    }

    /// Applies the remote description. On success, candidates parked by
    /// [`RtcPeerConnection::add_ice_candidate`] are flushed to the engine
    /// in arrival order and their promises settle individually.
    pub fn set_remote_description(&self, desc: &SessionDescription) -> Promise<()> {
        if self.closed.load(Ordering::Acquire) {
            return self.rejected(CONNECTION_ENDED);
        }
        let engine_desc = match desc.to_engine() {
            Ok(desc) => desc,
            Err(e) => {
                return Promise::new(&self.dispatcher, move |_, rejecter| rejecter.reject(e))
            }
        };
        let pc = self.pc.clone();
        let runtime = self.runtime.clone();
        let parked = self.parked_candidates.clone();
        let has_remote = self.has_remote_description.clone();
        Promise::new(&self.dispatcher, move |resolver, rejecter| {
            runtime.spawn(async move {
                match pc.set_remote_description(engine_desc).await {
                    Ok(()) => {
                        resolver.resolve(());
                        let flushed = {
                            let mut parked = parked.lock();
                            has_remote.store(true, Ordering::Release);
                            std::mem::take(&mut *parked)
                        };
                        if !flushed.is_empty() {
                            debug!(count = flushed.len(), "flushing parked candidates");
                        }
                        for entry in flushed {
                            match pc.add_ice_candidate(entry.candidate.to_engine()).await {
                                Ok(()) => entry.resolver.resolve(()),
                                Err(e) => {
                                    warn!("parked candidate refused: {e}");
                                    entry.rejecter.reject(Error::new(CANDIDATE_UNUSABLE));
                                }
                            }
                        }
                    }
                    Err(e) => rejecter
                        .reject(Error::new(format!("Failed to set remote description: {e}"))),
                }
            });
        })
    }

    /// Hands a trickled candidate to the engine. Candidates arriving
    /// before any remote description are parked; their promises settle
    /// when the description lands (or reject if the connection closes
    /// first).
    pub fn add_ice_candidate(&self, candidate: &IceCandidate) -> Promise<()> {
        if self.closed.load(Ordering::Acquire) {
            return self.rejected(CONNECTION_ENDED);
        }
        let candidate = candidate.clone();
        let pc = self.pc.clone();
        let runtime = self.runtime.clone();
        let parked = self.parked_candidates.clone();
        let has_remote = self.has_remote_description.clone();
        Promise::new(&self.dispatcher, move |resolver, rejecter| {
            {
                let mut parked = parked.lock();
                if !has_remote.load(Ordering::Acquire) {
                    debug!("candidate parked until a remote description is set");
                    parked.push(ParkedCandidate {
                        candidate,
                        resolver,
                        rejecter,
                    });
                    return;
                }
            }
            runtime.spawn(async move {
                match pc.add_ice_candidate(candidate.to_engine()).await {
                    Ok(()) => resolver.resolve(()),
                    Err(e) => {
                        warn!("candidate refused: {e}");
                        rejecter.reject(Error::new(CANDIDATE_UNUSABLE));
                    }
                }
            });
        })
    }

    pub fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<RtcDataChannel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(CONNECTION_ENDED));
        }
        let pc = self.pc.clone();
        let label = label.to_string();
        let engine_init = init.into();
        let channel = self
            .runtime
            .block_on(async move { pc.create_data_channel(&label, Some(engine_init)).await })
            .map_err(|e| Error::new(format!("Failed to create data channel: {e}")))?;
        Ok(RtcDataChannel::wrap(
            channel,
            self.dispatcher.clone(),
            self.runtime.clone(),
        ))
    }

    /// Attaches the stream's local tracks as senders on this connection.
    pub fn add_stream(&self, stream: &Arc<MediaStream>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(CONNECTION_ENDED));
        }
        for track in stream.tracks() {
            let Some(local) = track.local() else { continue };
            let local = local.clone() as Arc<dyn TrackLocal + Send + Sync>;
            let pc = self.pc.clone();
            let sender = self
                .runtime
                .block_on(async move { pc.add_track(local).await })
                .map_err(|e| Error::new(format!("Failed to add track: {e}")))?;
            self.senders.lock().push((track.id().to_string(), sender));
        }
        self.local_streams.lock().push(stream.clone());
        Ok(())
    }

    /// Detaches the stream's tracks from this connection.
    pub fn remove_stream(&self, stream: &Arc<MediaStream>) -> Result<()> {
        for track in stream.tracks() {
            let sender = {
                let mut senders = self.senders.lock();
                senders
                    .iter()
                    .position(|(id, _)| id == track.id())
                    .map(|index| senders.remove(index).1)
            };
            if let Some(sender) = sender {
                let pc = self.pc.clone();
                self.runtime
                    .block_on(async move { pc.remove_track(&sender).await })
                    .map_err(|e| Error::new(format!("Failed to remove track: {e}")))?;
            }
        }
        self.local_streams.lock().retain(|s| s.id() != stream.id());
        Ok(())
    }

    pub fn local_streams(&self) -> Vec<Arc<MediaStream>> {
        self.local_streams.lock().clone()
    }

    pub fn remote_streams(&self) -> Vec<Arc<MediaStream>> {
        self.remote_streams.lock().clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state().into()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.pc.ice_connection_state().into()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.pc.ice_gathering_state().into()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.clone();
        self.runtime
            .block_on(async move { pc.local_description().await })
            .as_ref()
            .and_then(SessionDescription::from_engine)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.clone();
        self.runtime
            .block_on(async move { pc.remote_description().await })
            .as_ref()
            .and_then(SessionDescription::from_engine)
    }

    pub fn current_local_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.clone();
        self.runtime
            .block_on(async move { pc.current_local_description().await })
            .as_ref()
            .and_then(SessionDescription::from_engine)
    }

    pub fn current_remote_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.clone();
        self.runtime
            .block_on(async move { pc.current_remote_description().await })
            .as_ref()
            .and_then(SessionDescription::from_engine)
    }

    pub fn pending_local_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.clone();
        self.runtime
            .block_on(async move { pc.pending_local_description().await })
            .as_ref()
            .and_then(SessionDescription::from_engine)
    }

    pub fn pending_remote_description(&self) -> Option<SessionDescription> {
        let pc = self.pc.clone();
        self.runtime
            .block_on(async move { pc.pending_remote_description().await })
            .as_ref()
            .and_then(SessionDescription::from_engine)
    }

    /// Closes the connection. Parked candidates reject, synthesized remote
    /// streams are announced through `on_remove_stream`, and the engine
    /// connection shuts down. Repeat calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("peer connection closing");
        let parked = std::mem::take(&mut *self.parked_candidates.lock());
        for entry in parked {
            entry.rejecter.reject(Error::new(NO_REMOTE_DESCRIPTION));
        }
        let streams = self.remote_streams.lock().clone();
        let handler = self.handlers.lock().remove_stream.clone();
        if let Some(handler) = handler {
            for stream in streams {
                let handler = handler.clone();
                self.dispatcher.call(move || handler(stream));
            }
        }
        let handler = self.handlers.lock().ice_candidates_removed.clone();
        if let Some(handler) = handler {
            self.dispatcher.call(move || handler());
        }
        let pc = self.pc.clone();
        self.runtime.spawn(async move {
            if let Err(e) = pc.close().await {
                warn!("engine close failed: {e}");
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn on_negotiation_needed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().negotiation_needed = Some(Arc::new(callback));
    }

    pub fn on_signaling_state_change(
        &self,
        callback: impl Fn(SignalingState) + Send + Sync + 'static,
    ) {
        self.handlers.lock().signaling_state_change = Some(Arc::new(callback));
    }

    pub fn on_ice_connection_state_change(
        &self,
        callback: impl Fn(IceConnectionState) + Send + Sync + 'static,
    ) {
        self.handlers.lock().ice_connection_state_change = Some(Arc::new(callback));
    }

    pub fn on_ice_gathering_state_change(
        &self,
        callback: impl Fn(IceGatheringState) + Send + Sync + 'static,
    ) {
        self.handlers.lock().ice_gathering_state_change = Some(Arc::new(callback));
    }

    pub fn on_ice_candidate(&self, callback: impl Fn(IceCandidate) + Send + Sync + 'static) {
        self.handlers.lock().ice_candidate = Some(Arc::new(callback));
    }

    /// The engine does not surface mid-session candidate removal; this
    /// fires once when the connection closes and its candidates become
    /// invalid.
    pub fn on_ice_candidates_removed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().ice_candidates_removed = Some(Arc::new(callback));
    }

    pub fn on_data_channel(
        &self,
        callback: impl Fn(Arc<RtcDataChannel>) + Send + Sync + 'static,
    ) {
        self.handlers.lock().data_channel = Some(Arc::new(callback));
    }

    pub fn on_add_stream(&self, callback: impl Fn(Arc<MediaStream>) + Send + Sync + 'static) {
        self.handlers.lock().add_stream = Some(Arc::new(callback));
    }

    pub fn on_remove_stream(&self, callback: impl Fn(Arc<MediaStream>) + Send + Sync + 'static) {
        self.handlers.lock().remove_stream = Some(Arc::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_offer_fulfills_with_sdp() {
        let context = RtcContext::new().unwrap();
        let pc = RtcPeerConnection::new(&context, &offline_config()).unwrap();
        pc.create_data_channel("bootstrap", &DataChannelInit::default())
            .unwrap();
        let offer = pc.create_offer();
        offer.wait();
        let desc = offer.value().unwrap();
        assert!(desc.sdp.starts_with("v=0"));
        assert_eq!(desc.sdp_type, crate::peer::SdpType::Offer);
        pc.close();
        context.shutdown();
    }

    #[test]
    fn test_state_getters_start_neutral() {
        let context = RtcContext::new().unwrap();
        let pc = RtcPeerConnection::new(&context, &offline_config()).unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(pc.ice_connection_state(), IceConnectionState::New);
        assert_eq!(pc.ice_gathering_state(), IceGatheringState::New);
        assert!(pc.local_description().is_none());
        assert!(pc.remote_description().is_none());
        pc.close();
        context.shutdown();
    }

    #[test]
    fn test_candidate_without_remote_description_parks_then_close_rejects() {
        let context = RtcContext::new().unwrap();
        let pc = RtcPeerConnection::new(&context, &offline_config()).unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        };
        let promise = pc.add_ice_candidate(&candidate);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!promise.is_completed());
        pc.close();
        promise.wait();
        assert_eq!(
            promise.error().map(|e| e.message().to_string()),
            Some(NO_REMOTE_DESCRIPTION.to_string())
        );
        context.shutdown();
    }

    #[test]
    fn test_operations_after_close_reject() {
        let context = RtcContext::new().unwrap();
        let pc = RtcPeerConnection::new(&context, &offline_config()).unwrap();
        pc.close();
        pc.close();
        assert!(pc.is_closed());
        let offer = pc.create_offer();
        offer.wait();
        assert_eq!(
            offer.error().map(|e| e.message().to_string()),
            Some(CONNECTION_ENDED.to_string())
        );
        assert!(pc
            .create_data_channel("late", &DataChannelInit::default())
            .is_err());
        context.shutdown();
    }

    #[test]
    fn test_created_data_channel_starts_connecting() {
        let context = RtcContext::new().unwrap();
        let pc = RtcPeerConnection::new(&context, &offline_config()).unwrap();
        let channel = pc
            .create_data_channel("chat", &DataChannelInit::default())
            .unwrap();
        assert_eq!(channel.label(), "chat");
        assert_eq!(
            channel.ready_state(),
            crate::channels::DataChannelState::Connecting
        );
        assert!(channel.send(b"too early").is_err());
        pc.close();
        context.shutdown();
    }
}
