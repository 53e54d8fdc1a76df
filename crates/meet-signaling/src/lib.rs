//! Signaling and offer/answer negotiation for two-party media sessions over
//! a room-based rendezvous service.

pub mod channel;
pub mod config;
pub mod engine;
pub mod latch;
pub mod negotiation;
pub mod protocol;
pub mod room;
pub mod sdp;
pub mod session;

pub use channel::{ChannelError, ChannelEvent, ChannelState, SignalingChannel};
pub use config::{Config, ConfigError, NegotiationConfig};
pub use engine::{
    EngineConnectionState, EngineError, EngineEvent, EngineFactory, MediaConstraints,
    NegotiationEngine,
};
pub use negotiation::{
    NegotiationController, NegotiationError, NegotiationEvent, NegotiationHandle,
    NegotiationRole,
};
pub use protocol::{IceCandidate, IceServer, SdpKind, SessionDescription, SignalingParameters};
pub use room::{DeliveryError, JoinError, RoomClient};
pub use session::{DeliveryRoute, SessionCoordinator, SessionError, SessionOutcome, SessionSummary};
