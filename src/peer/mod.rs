//! Peer connection surface: session description and candidate types plus
//! the connection itself.

mod connection;

pub use connection::RtcPeerConnection;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// An SDP blob plus its role in the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub(crate) fn to_engine(&self) -> Result<RTCSessionDescription> {
        let result = match self.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(self.sdp.clone()),
            SdpType::Pranswer => RTCSessionDescription::pranswer(self.sdp.clone()),
            SdpType::Rollback => {
                return Err(Error::new("Rollback descriptions are not supported."))
            }
        };
        result.map_err(|e| Error::new(format!("Invalid session description: {e}")))
    }

    pub(crate) fn from_engine(desc: &RTCSessionDescription) -> Option<Self> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => return None,
        };
        Some(Self {
            sdp_type,
            sdp: desc.sdp.clone(),
        })
    }
}

/// A trickled ICE candidate in init form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    pub(crate) fn to_engine(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: Some(self.sdp_mid.clone()),
            sdp_mline_index: Some(self.sdp_mline_index),
            username_fragment: None,
        }
    }

    pub(crate) fn from_engine(candidate: &RTCIceCandidate) -> Result<Self> {
        let init = candidate
            .to_json()
            .map_err(|e| Error::new(format!("Failed to serialize candidate: {e}")))?;
        Ok(Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid.unwrap_or_default(),
            sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
        })
    }
}

/// Signaling state, defaulting to `Stable` where the engine reports
/// nothing meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveLocalPranswer,
    HaveRemoteOffer,
    HaveRemotePranswer,
    Closed,
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }
}

/// ICE connection state, defaulting to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => {
                IceConnectionState::New
            }
        }
    }
}

/// ICE gathering state, defaulting to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

impl From<RTCIceGatheringState> for IceGatheringState {
    fn from(state: RTCIceGatheringState) -> Self {
        match state {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            RTCIceGatheringState::New | RTCIceGatheringState::Unspecified => {
                IceGatheringState::New
            }
        }
    }
}

impl From<RTCIceGathererState> for IceGatheringState {
    fn from(state: RTCIceGathererState) -> Self {
        match state {
            RTCIceGathererState::Gathering => IceGatheringState::Gathering,
            RTCIceGathererState::Complete => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }
}
