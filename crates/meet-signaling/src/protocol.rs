//! Wire types shared by the room client, the signaling channel and the
//! negotiation controller.
//!
//! The JSON shapes here are fixed by the rendezvous service:
//! candidates travel as `{"id", "label", "candidate"}`, typed messages carry a
//! `type` discriminator and inbound channel frames wrap the typed message in a
//! string-encoded `msg` field.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description text tagged with its role in the offer/answer exchange.
///
/// Treated as an immutable value: transforms produce a new description via
/// [`SessionDescription::map_sdp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp)
    }

    pub fn map_sdp<F>(&self, transform: F) -> Self
    where
        F: FnOnce(&str) -> String,
    {
        Self {
            kind: self.kind,
            sdp: transform(&self.sdp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "id")]
    pub sdp_mid: String,
    #[serde(rename = "label")]
    pub sdp_mline_index: u32,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(
        sdp_mid: impl Into<String>,
        sdp_mline_index: u32,
        candidate: impl Into<String>,
    ) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }
}

/// One STUN/TURN server entry handed to the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RawIceServer")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServer {
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUrls {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawIceServer {
    #[serde(alias = "url")]
    urls: RawUrls,
    #[serde(default)]
    username: String,
    #[serde(default)]
    credential: String,
}

impl From<RawIceServer> for IceServer {
    fn from(raw: RawIceServer) -> Self {
        let urls = match raw.urls {
            RawUrls::One(url) => vec![url],
            RawUrls::Many(urls) => urls,
        };
        Self {
            urls,
            username: raw.username,
            credential: raw.credential,
        }
    }
}

/// Everything the room handshake hands to the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingParameters {
    pub room_id: String,
    pub client_id: String,
    pub is_initiator: bool,
    pub ice_servers: Vec<IceServer>,
    pub initial_offer: Option<SessionDescription>,
    pub initial_candidates: Vec<IceCandidate>,
    pub channel_url: String,
    pub channel_post_url: String,
}

/// Typed message exchanged with the peer, either through the room message
/// endpoint or through the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Candidate(IceCandidate),
    RemoveCandidates { candidates: Vec<IceCandidate> },
    Offer { sdp: String },
    Answer { sdp: String },
    Bye,
}

impl SignalMessage {
    pub const KNOWN_TYPES: [&'static str; 5] =
        ["candidate", "remove-candidates", "offer", "answer", "bye"];

    pub fn description(desc: &SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => SignalMessage::Offer {
                sdp: desc.sdp.clone(),
            },
            SdpKind::Answer => SignalMessage::Answer {
                sdp: desc.sdp.clone(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Candidate(_) => "candidate",
            SignalMessage::RemoveCandidates { .. } => "remove-candidates",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Bye => "bye",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Reads the `type` discriminator without committing to a variant, so
    /// callers can tell an unknown type apart from a malformed payload.
    pub fn peek_type(value: &Value) -> Option<&str> {
        value.get("type").and_then(Value::as_str)
    }
}

/// Inbound frame from the signaling channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelEnvelope {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub error: String,
}

/// Outbound frame to the signaling channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ChannelCommand {
    Register { roomid: String, clientid: String },
    Send { msg: String },
}
