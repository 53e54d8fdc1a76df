//! Capability interface of the external negotiation engine.
//!
//! The engine does the real work (ICE gathering, DTLS/SRTP, media); the
//! negotiation controller only asks it to create and apply descriptions and
//! candidates. Asynchronous notifications flow back as [`EngineEvent`]s on the
//! channel handed to the engine when it is built.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, SessionDescription, SignalingParameters};

pub mod mock;
#[cfg(feature = "webrtc-engine")]
pub mod rtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A locally gathered candidate that must reach the peer.
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    ConnectionState(EngineConnectionState),
    /// Consumed by the media layer; the controller only logs these.
    StreamAdded(String),
    StreamRemoved(String),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine rejected request: {0}")]
    Rejected(String),
    #[error("engine already closed")]
    Closed,
}

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError>;

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    async fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds an engine once the room handshake has produced ICE servers.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        parameters: &SignalingParameters,
        events: EngineEventSender,
    ) -> Result<Box<dyn NegotiationEngine>, EngineError>;
}
