//! Offer/answer state machine driving the negotiation engine.
//!
//! The controller runs as a single task. Every input (caller commands and
//! engine events) is handled to completion before the next one is read, and
//! engine requests are awaited inline, so the candidate queue and the
//! description slots are only ever touched by that task.

use std::fmt;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::NegotiationConfig;
use crate::engine::{
    EngineConnectionState, EngineError, EngineEvent, EngineEvents, NegotiationEngine,
};
use crate::latch::ErrorLatch;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription, SignalingParameters};
use crate::sdp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

impl NegotiationRole {
    pub fn from_initiator_flag(is_initiator: bool) -> Self {
        if is_initiator {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        }
    }

    fn local_kind(self) -> SdpKind {
        match self {
            NegotiationRole::Initiator => SdpKind::Offer,
            NegotiationRole::Responder => SdpKind::Answer,
        }
    }

    fn remote_kind(self) -> SdpKind {
        match self {
            NegotiationRole::Initiator => SdpKind::Answer,
            NegotiationRole::Responder => SdpKind::Offer,
        }
    }
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationRole::Initiator => f.write_str("initiator"),
            NegotiationRole::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to create local {kind}: {source}")]
    CreateDescription { kind: SdpKind, source: EngineError },
    #[error("failed to apply local {kind}: {source}")]
    SetLocalDescription { kind: SdpKind, source: EngineError },
    #[error("failed to apply remote {kind}: {source}")]
    SetRemoteDescription { kind: SdpKind, source: EngineError },
    #[error("failed to apply remote candidate: {0}")]
    Candidate(EngineError),
    #[error("unexpected remote {kind} for {role}")]
    UnexpectedDescription { kind: SdpKind, role: NegotiationRole },
    #[error("peer connection failed")]
    ConnectionFailed,
}

/// Outward notifications; the session coordinator routes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    LocalCandidatesRemoved(Vec<IceCandidate>),
    Connected,
    Disconnected,
    Failed(NegotiationError),
    Closed,
}

pub type NegotiationEvents = mpsc::UnboundedReceiver<NegotiationEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingLocalDescription,
    AwaitingRemoteDescription,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueuedOp {
    Add(IceCandidate),
    Remove(Vec<IceCandidate>),
}

/// Remote candidate operations held back until both descriptions are
/// applied. Drains exactly once; afterwards operations pass straight through.
#[derive(Debug)]
enum CandidateQueue {
    Queuing(Vec<QueuedOp>),
    Drained,
}

impl CandidateQueue {
    fn new() -> Self {
        CandidateQueue::Queuing(Vec::new())
    }

    /// Queues `op`, or hands it back when the queue has already drained.
    fn push(&mut self, op: QueuedOp) -> Option<QueuedOp> {
        match self {
            CandidateQueue::Queuing(ops) => {
                ops.push(op);
                None
            }
            CandidateQueue::Drained => Some(op),
        }
    }

    /// Returns the buffered operations the first time it is called.
    fn drain(&mut self) -> Option<Vec<QueuedOp>> {
        match std::mem::replace(self, CandidateQueue::Drained) {
            CandidateQueue::Queuing(ops) => Some(ops),
            CandidateQueue::Drained => None,
        }
    }

    fn len(&self) -> usize {
        match self {
            CandidateQueue::Queuing(ops) => ops.len(),
            CandidateQueue::Drained => 0,
        }
    }
}

enum Command {
    Start(Box<SignalingParameters>),
    RemoteDescription(SessionDescription),
    RemoteCandidate(IceCandidate),
    RemoteCandidatesRemoved(Vec<IceCandidate>),
    Close(oneshot::Sender<()>),
}

/// Cheap handle posting operations to the controller task.
#[derive(Clone)]
pub struct NegotiationHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl NegotiationHandle {
    pub fn start(&self, parameters: SignalingParameters) {
        self.post(Command::Start(Box::new(parameters)));
    }

    pub fn on_remote_description(&self, desc: SessionDescription) {
        self.post(Command::RemoteDescription(desc));
    }

    pub fn on_remote_candidate(&self, candidate: IceCandidate) {
        self.post(Command::RemoteCandidate(candidate));
    }

    pub fn on_remote_candidates_removed(&self, candidates: Vec<IceCandidate>) {
        self.post(Command::RemoteCandidatesRemoved(candidates));
    }

    /// Closes the engine and resolves once every operation posted before it
    /// has been handled. Calling it again is a no-op.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(target: "meet::negotiation", "controller closed; operation dropped");
        }
    }
}

pub struct NegotiationController {
    engine: Option<Box<dyn NegotiationEngine>>,
    config: NegotiationConfig,
    role: Option<NegotiationRole>,
    phase: Phase,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    queue: CandidateQueue,
    latch: ErrorLatch,
    events: mpsc::UnboundedSender<NegotiationEvent>,
}

impl NegotiationController {
    /// Spawns the controller task on the current runtime.
    pub fn spawn(
        engine: Box<dyn NegotiationEngine>,
        engine_events: EngineEvents,
        config: NegotiationConfig,
    ) -> (NegotiationHandle, NegotiationEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = NegotiationController {
            engine: Some(engine),
            config,
            role: None,
            phase: Phase::Idle,
            local: None,
            remote: None,
            queue: CandidateQueue::new(),
            latch: ErrorLatch::new(),
            events: events_tx,
        };
        tokio::spawn(controller.run(commands_rx, engine_events));
        (
            NegotiationHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut engine_events: EngineEvents,
    ) {
        let mut engine_open = true;
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Close(ack)) => {
                        self.close().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close().await;
                        break;
                    }
                },
                event = engine_events.recv(), if engine_open => match event {
                    Some(event) => self.handle_engine_event(event),
                    None => engine_open = false,
                },
            }
        }
        tracing::debug!(target: "meet::negotiation", "controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        if self.phase == Phase::Failed {
            tracing::debug!(target: "meet::negotiation", "negotiation failed; operation ignored");
            return;
        }
        match command {
            Command::Start(parameters) => self.start(*parameters).await,
            Command::RemoteDescription(desc) => self.on_remote_description(desc).await,
            Command::RemoteCandidate(candidate) => {
                self.on_remote_candidate_op(QueuedOp::Add(candidate)).await
            }
            Command::RemoteCandidatesRemoved(candidates) => {
                self.on_remote_candidate_op(QueuedOp::Remove(candidates)).await
            }
            Command::Close(_) => {}
        }
    }

    async fn start(&mut self, parameters: SignalingParameters) {
        if self.phase != Phase::Idle {
            tracing::warn!(target: "meet::negotiation", phase = ?self.phase, "session already started");
            return;
        }
        let role = NegotiationRole::from_initiator_flag(parameters.is_initiator);
        self.role = Some(role);
        tracing::info!(
            target: "meet::negotiation",
            %role,
            initial_candidates = parameters.initial_candidates.len(),
            has_offer = parameters.initial_offer.is_some(),
            "starting negotiation"
        );

        for candidate in parameters.initial_candidates {
            if let Some(op) = self.queue.push(QueuedOp::Add(candidate)) {
                self.apply(op).await;
            }
        }

        match role {
            NegotiationRole::Initiator => {
                self.enter(Phase::AwaitingLocalDescription);
                self.create_local_description(role).await;
            }
            NegotiationRole::Responder => {
                self.enter(Phase::AwaitingRemoteDescription);
                if let Some(offer) = parameters.initial_offer {
                    self.on_remote_description(offer).await;
                }
            }
        }
    }

    async fn create_local_description(&mut self, role: NegotiationRole) {
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        let kind = role.local_kind();
        let constraints = self.config.constraints;
        let created = match kind {
            SdpKind::Offer => engine.create_offer(&constraints).await,
            SdpKind::Answer => engine.create_answer(&constraints).await,
        };
        match created {
            Ok(desc) => self.on_local_description_ready(desc).await,
            Err(source) => self.fail(NegotiationError::CreateDescription { kind, source }),
        }
    }

    async fn on_local_description_ready(&mut self, desc: SessionDescription) {
        if self.local.is_some() {
            tracing::debug!(target: "meet::negotiation", kind = %desc.kind, "local description already set");
            return;
        }
        let desc = desc.map_sdp(|text| sdp::prefer_codec(text, &self.config.video_codec));
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        if let Err(source) = engine.set_local_description(&desc).await {
            self.fail(NegotiationError::SetLocalDescription {
                kind: desc.kind,
                source,
            });
            return;
        }
        tracing::debug!(target: "meet::negotiation", kind = %desc.kind, "local description applied");
        self.local = Some(desc.clone());
        self.emit(NegotiationEvent::LocalDescription(desc));
        self.enter(Phase::AwaitingRemoteDescription);
        self.maybe_drain().await;
    }

    async fn on_remote_description(&mut self, desc: SessionDescription) {
        let Some(role) = self.role else {
            tracing::warn!(target: "meet::negotiation", kind = %desc.kind, "remote description before start; ignored");
            return;
        };
        if desc.kind != role.remote_kind() {
            self.fail(NegotiationError::UnexpectedDescription {
                kind: desc.kind,
                role,
            });
            return;
        }
        if self.remote.is_some() {
            tracing::warn!(target: "meet::negotiation", kind = %desc.kind, "duplicate remote description ignored");
            return;
        }

        let desc = desc.map_sdp(|text| {
            let preferred = sdp::prefer_codec(text, &self.config.video_codec);
            sdp::set_start_bitrate(
                &preferred,
                &self.config.audio_codec,
                self.config.audio_start_bitrate_kbps,
            )
        });
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        if let Err(source) = engine.set_remote_description(&desc).await {
            self.fail(NegotiationError::SetRemoteDescription {
                kind: desc.kind,
                source,
            });
            return;
        }
        tracing::debug!(target: "meet::negotiation", kind = %desc.kind, "remote description applied");
        self.remote = Some(desc);

        match role {
            NegotiationRole::Responder => {
                self.enter(Phase::AwaitingLocalDescription);
                self.create_local_description(role).await;
            }
            NegotiationRole::Initiator => self.maybe_drain().await,
        }
    }

    async fn on_remote_candidate_op(&mut self, op: QueuedOp) {
        match self.queue.push(op) {
            Some(op) => self.apply(op).await,
            None => {
                tracing::trace!(target: "meet::negotiation", queued = self.queue.len(), "remote candidate queued")
            }
        }
    }

    /// Drains the queue once both descriptions are in place.
    async fn maybe_drain(&mut self) {
        if self.local.is_none() || self.remote.is_none() {
            return;
        }
        let Some(ops) = self.queue.drain() else {
            return;
        };
        tracing::debug!(target: "meet::negotiation", count = ops.len(), "draining queued candidates");
        self.enter(Phase::Negotiating);
        for op in ops {
            if self.phase == Phase::Failed {
                break;
            }
            self.apply(op).await;
        }
    }

    async fn apply(&mut self, op: QueuedOp) {
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        let result = match &op {
            QueuedOp::Add(candidate) => engine.add_ice_candidate(candidate).await,
            QueuedOp::Remove(candidates) => engine.remove_ice_candidates(candidates).await,
        };
        if let Err(err) = result {
            self.fail(NegotiationError::Candidate(err));
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        if self.phase == Phase::Closed {
            return;
        }
        match event {
            EngineEvent::IceCandidate(candidate) => {
                if self.phase != Phase::Failed {
                    self.emit(NegotiationEvent::LocalCandidate(candidate));
                }
            }
            EngineEvent::IceCandidatesRemoved(candidates) => {
                if self.phase != Phase::Failed {
                    self.emit(NegotiationEvent::LocalCandidatesRemoved(candidates));
                }
            }
            EngineEvent::ConnectionState(state) => self.on_connection_state(state),
            EngineEvent::StreamAdded(id) => {
                tracing::debug!(target: "meet::negotiation", stream = %id, "remote stream added")
            }
            EngineEvent::StreamRemoved(id) => {
                tracing::debug!(target: "meet::negotiation", stream = %id, "remote stream removed")
            }
        }
    }

    fn on_connection_state(&mut self, state: EngineConnectionState) {
        tracing::info!(target: "meet::negotiation", ?state, "connection state changed");
        match state {
            EngineConnectionState::Connected => {
                if self.phase != Phase::Failed {
                    self.enter(Phase::Connected);
                    self.emit(NegotiationEvent::Connected);
                }
            }
            EngineConnectionState::Disconnected => self.emit(NegotiationEvent::Disconnected),
            EngineConnectionState::Failed => self.fail(NegotiationError::ConnectionFailed),
            EngineConnectionState::New
            | EngineConnectionState::Checking
            | EngineConnectionState::Closed => {}
        }
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            tracing::debug!(target: "meet::negotiation", from = ?self.phase, to = ?next, "phase changed");
            self.phase = next;
        }
    }

    fn fail(&mut self, err: NegotiationError) {
        tracing::error!(target: "meet::negotiation", error = %err, "negotiation fault");
        self.enter(Phase::Failed);
        if self.latch.trip() {
            self.emit(NegotiationEvent::Failed(err));
        } else {
            tracing::debug!(target: "meet::negotiation", "fault already reported; suppressed");
        }
    }

    async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let dropped = self.queue.len();
        self.queue = CandidateQueue::Drained;
        if let Some(engine) = self.engine.take() {
            if let Err(err) = engine.close().await {
                tracing::warn!(target: "meet::negotiation", error = %err, "engine close failed");
            }
        }
        self.enter(Phase::Closed);
        tracing::info!(
            target: "meet::negotiation",
            dropped_candidates = dropped,
            failed = self.latch.is_tripped(),
            "negotiation closed"
        );
        self.emit(NegotiationEvent::Closed);
    }

    fn emit(&self, event: NegotiationEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(target: "meet::negotiation", "event receiver dropped");
        }
    }
}
