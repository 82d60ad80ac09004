//! Peer connection configuration and its mapping onto the engine.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Which candidates ICE may use. `Public` has no engine equivalent and is
/// treated as `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    Relay,
    Public,
    #[default]
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    #[default]
    MaxBundle,
    MaxCompat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtcpMuxPolicy {
    Negotiate,
    #[default]
    Require,
}

/// Connection configuration. The default carries a single Google STUN
/// server, max-bundle, all-transports ICE, and required RTCP muxing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
    pub ice_candidate_pool_size: u8,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::MaxBundle,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
            ice_candidate_pool_size: 0,
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
        }
    }
}

impl From<IceTransportPolicy> for RTCIceTransportPolicy {
    fn from(policy: IceTransportPolicy) -> Self {
        match policy {
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            IceTransportPolicy::Public | IceTransportPolicy::All => RTCIceTransportPolicy::All,
        }
    }
}

impl From<BundlePolicy> for RTCBundlePolicy {
    fn from(policy: BundlePolicy) -> Self {
        match policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
        }
    }
}

impl From<RtcpMuxPolicy> for RTCRtcpMuxPolicy {
    fn from(policy: RtcpMuxPolicy) -> Self {
        match policy {
            RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
            RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
        }
    }
}

impl From<&RtcConfiguration> for RTCConfiguration {
    fn from(config: &RtcConfiguration) -> Self {
        RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(RTCIceServer::from).collect(),
            ice_transport_policy: config.ice_transport_policy.into(),
            bundle_policy: config.bundle_policy.into(),
            rtcp_mux_policy: config.rtcp_mux_policy.into(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = RtcConfiguration::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(config.bundle_policy, BundlePolicy::MaxBundle);
        assert_eq!(config.ice_transport_policy, IceTransportPolicy::All);
        assert_eq!(config.rtcp_mux_policy, RtcpMuxPolicy::Require);
        assert_eq!(config.ice_candidate_pool_size, 0);
    }

    #[test]
    fn test_engine_conversion_preserves_fields() {
        let config = RtcConfiguration {
            ice_servers: vec![IceServer {
                urls: vec!["turn:turn.example.org".into()],
                username: "user".into(),
                credential: "pass".into(),
            }],
            ice_transport_policy: IceTransportPolicy::Relay,
            bundle_policy: BundlePolicy::Balanced,
            rtcp_mux_policy: RtcpMuxPolicy::Negotiate,
            ice_candidate_pool_size: 4,
        };
        let engine: RTCConfiguration = (&config).into();
        assert_eq!(engine.ice_servers.len(), 1);
        assert_eq!(engine.ice_servers[0].username, "user");
        assert_eq!(engine.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(engine.bundle_policy, RTCBundlePolicy::Balanced);
        assert_eq!(engine.rtcp_mux_policy, RTCRtcpMuxPolicy::Negotiate);
        assert_eq!(engine.ice_candidate_pool_size, 4);
    }

    #[test]
    fn test_public_policy_maps_to_all() {
        let policy: RTCIceTransportPolicy = IceTransportPolicy::Public.into();
        assert_eq!(policy, RTCIceTransportPolicy::All);
    }
}
