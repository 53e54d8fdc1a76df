use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    EngineError, EngineEvent, EngineEventSender, EngineFactory, MediaConstraints,
    NegotiationEngine,
};
use crate::protocol::{IceCandidate, IceServer, SessionDescription, SignalingParameters};

pub const MOCK_OFFER_SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 100 96\r\n\
a=rtpmap:100 H264/90000\r\n\
a=rtpmap:96 VP8/90000\r\n";

pub const MOCK_ANSWER_SDP: &str = "v=0\r\n\
o=- 3 4 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 100 96\r\n\
a=rtpmap:100 H264/90000\r\n\
a=rtpmap:96 VP8/90000\r\n";

/// One capability call observed by [`MockEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    RemoveCandidates(Vec<IceCandidate>),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    failures: HashSet<FailPoint>,
    events: Option<EngineEventSender>,
    ice_servers: Vec<IceServer>,
    closed: bool,
}

/// Engine double that records every call in order.
///
/// Clones share state, so a test can keep one clone for inspection while the
/// controller owns another. It also acts as its own [`EngineFactory`].
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.lock().failures.insert(point);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// ICE servers handed to the factory for the last session.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.lock().ice_servers.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pushes an event as if the engine raised it. Returns `false` when no
    /// controller is listening.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.lock().events.as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: EngineCall, point: Option<FailPoint>) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.calls.push(call);
        match point {
            Some(point) if state.failures.contains(&point) => {
                Err(EngineError::Rejected(format!("{point:?} failed")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    async fn create_offer(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer, Some(FailPoint::CreateOffer))?;
        Ok(SessionDescription::offer(MOCK_OFFER_SDP))
    }

    async fn create_answer(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer, Some(FailPoint::CreateAnswer))?;
        Ok(SessionDescription::answer(MOCK_ANSWER_SDP))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocal(desc.clone()), Some(FailPoint::SetLocal))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemote(desc.clone()), Some(FailPoint::SetRemote))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.record(
            EngineCall::AddCandidate(candidate.clone()),
            Some(FailPoint::AddCandidate),
        )
    }

    async fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> Result<(), EngineError> {
        self.record(EngineCall::RemoveCandidates(candidates.to_vec()), None)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Close);
        state.closed = true;
        state.events = None;
        Ok(())
    }
}

#[async_trait]
impl EngineFactory for MockEngine {
    async fn create(
        &self,
        parameters: &SignalingParameters,
        events: EngineEventSender,
    ) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        {
            let mut state = self.lock();
            state.ice_servers = parameters.ice_servers.clone();
            state.events = Some(events);
        }
        Ok(Box::new(self.clone()))
    }
}
