//! Browser-style WebRTC facade for embedders without an async runtime of
//! their own.
//!
//! The crate wraps the `webrtc` engine behind synchronous, callback-based
//! APIs. Long-running operations return a [`Promise`] that settles on a
//! dispatcher thread (or on an embedder-pumped loop); engine events are
//! marshalled onto the same dispatcher before user callbacks run. An
//! internal tokio runtime drives the engine and never leaks into the API.
//!
//! ```no_run
//! use rtc_bridge::{RtcConfiguration, RtcContext, RtcPeerConnection};
//!
//! let context = RtcContext::new()?;
//! let pc = RtcPeerConnection::new(&context, &RtcConfiguration::default())?;
//! let offer = pc.create_offer();
//! offer.wait();
//! if let Some(desc) = offer.value() {
//!     println!("{}", desc.sdp);
//! }
//! pc.close();
//! context.shutdown();
//! # Ok::<(), rtc_bridge::Error>(())
//! ```

pub mod channels;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod media;
pub mod peer;

pub use channels::{DataChannelInit, DataChannelState, RtcDataChannel};
pub use config::{BundlePolicy, IceServer, IceTransportPolicy, RtcConfiguration, RtcpMuxPolicy};
pub use context::RtcContext;
pub use dispatch::{Dispatcher, Dispose, Handle, Promise, WeakHandle};
pub use error::{Error, Result};
pub use media::{
    AudioBuffer, AudioPacket, AudioSink, AudioSource, MediaStream, MediaStreamTrack, TrackKind,
    TrackState, VideoFrame, VideoSource,
};
pub use peer::{
    IceCandidate, IceConnectionState, IceGatheringState, RtcPeerConnection, SdpType,
    SessionDescription, SignalingState,
};
