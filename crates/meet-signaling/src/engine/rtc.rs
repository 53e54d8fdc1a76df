//! Negotiation engine backed by the `webrtc` crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::{
    EngineConnectionState, EngineError, EngineEvent, EngineEventSender, EngineFactory,
    MediaConstraints, NegotiationEngine,
};
use crate::protocol::{IceCandidate, IceServer, SdpKind, SessionDescription, SignalingParameters};

fn build_api(setting: SettingEngine) -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn to_rejected<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Rejected(err.to_string())
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn connection_state(state: RTCPeerConnectionState) -> EngineConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => EngineConnectionState::Checking,
        RTCPeerConnectionState::Connected => EngineConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => EngineConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => EngineConnectionState::Failed,
        RTCPeerConnectionState::Closed => EngineConnectionState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
            EngineConnectionState::New
        }
    }
}

fn rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(to_rejected),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(to_rejected),
    }
}

pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
    receivers_added: AtomicBool,
}

impl RtcEngine {
    pub async fn new(
        ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> Result<Self, EngineError> {
        let api = build_api(SettingEngine::default())?;
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_setup_error)?);

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target: "meet::engine", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::new(
                            init.sdp_mid.unwrap_or_default(),
                            u32::from(init.sdp_mline_index.unwrap_or_default()),
                            init.candidate,
                        );
                        let _ = events.send(EngineEvent::IceCandidate(candidate));
                    }
                    Err(err) => {
                        tracing::warn!(target: "meet::engine", error = %err, "could not serialize local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target: "meet::engine", %state, "peer connection state");
                let _ = events.send(EngineEvent::ConnectionState(connection_state(state)));
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let stream = track.stream_id();
                tracing::debug!(target: "meet::engine", stream = %stream, kind = %track.kind(), "remote track");
                let _ = events.send(EngineEvent::StreamAdded(stream));
            })
        }));

        Ok(Self {
            pc,
            receivers_added: AtomicBool::new(false),
        })
    }

    async fn add_receivers(&self, constraints: &MediaConstraints) -> Result<(), EngineError> {
        if self.receivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let wanted = [
            (RTPCodecType::Audio, constraints.offer_to_receive_audio),
            (RTPCodecType::Video, constraints.offer_to_receive_video),
        ];
        for (kind, wanted) in wanted {
            if !wanted {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map_err(to_rejected)?;
        }
        Ok(())
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.add_receivers(constraints).await?;
        let offer = self.pc.create_offer(None).await.map_err(to_rejected)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(to_rejected)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(rtc_description(desc)?)
            .await
            .map_err(to_rejected)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(rtc_description(desc)?)
            .await
            .map_err(to_rejected)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let mline_index = u16::try_from(candidate.sdp_mline_index)
            .map_err(|_| EngineError::Rejected(format!("mline index {}", candidate.sdp_mline_index)))?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(mline_index),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_rejected)
    }

    async fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> Result<(), EngineError> {
        tracing::debug!(
            target: "meet::engine",
            count = candidates.len(),
            "candidate removal not supported by this engine; ignored"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await.map_err(to_rejected)
    }
}

/// Builds an [`RtcEngine`] per session.
#[derive(Debug, Default, Clone)]
pub struct RtcEngineFactory;

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        parameters: &SignalingParameters,
        events: EngineEventSender,
    ) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        tracing::debug!(
            target: "meet::engine",
            ice_servers = parameters.ice_servers.len(),
            "creating peer connection"
        );
        let engine = RtcEngine::new(&parameters.ice_servers, events).await?;
        Ok(Box::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_connection_states() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            EngineConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            EngineConnectionState::Failed
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Disconnected),
            EngineConnectionState::Disconnected
        );
    }

    #[test]
    fn converts_ice_servers() {
        let servers = vec![IceServer {
            urls: vec!["turn:turn.example.org:3478".into()],
            username: "user".into(),
            credential: "pass".into(),
        }];
        let converted = rtc_ice_servers(&servers);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].urls, servers[0].urls);
        assert_eq!(converted[0].username, "user");
        assert_eq!(converted[0].credential, "pass");
    }

    #[tokio::test]
    async fn offer_carries_audio_and_video_sections() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let engine = RtcEngine::new(&[], tx).await.unwrap();
        let offer = engine
            .create_offer(&MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio "));
        assert!(offer.sdp.contains("m=video "));
        engine.close().await.unwrap();
    }
}
