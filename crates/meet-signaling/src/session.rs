//! Glue between the room client, the signaling channel and the negotiation
//! controller for one session.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, ChannelEvent, ChannelState, SignalingChannel};
use crate::config::NegotiationConfig;
use crate::engine::{EngineError, EngineFactory};
use crate::negotiation::{
    NegotiationController, NegotiationError, NegotiationEvent, NegotiationHandle,
    NegotiationRole,
};
use crate::protocol::{SignalMessage, SignalingParameters};
use crate::room::{JoinError, RoomClient};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error("negotiation engine unavailable: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// How a session ended when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    RemoteClosed,
    Disconnected,
    LocalShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub room_id: String,
    pub client_id: String,
    pub role: NegotiationRole,
    pub outcome: SessionOutcome,
    /// Whether the media connection was ever established.
    pub connected: bool,
}

/// Which transport carries one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    RoomPost,
    Channel,
}

impl DeliveryRoute {
    pub fn select(role: NegotiationRole, message: &SignalMessage, channel: ChannelState) -> Self {
        match (role, message) {
            (NegotiationRole::Initiator, SignalMessage::Offer { .. }) => DeliveryRoute::RoomPost,
            (
                NegotiationRole::Initiator,
                SignalMessage::Candidate(_) | SignalMessage::RemoveCandidates { .. },
            ) if channel != ChannelState::Registered => DeliveryRoute::RoomPost,
            _ => DeliveryRoute::Channel,
        }
    }
}

enum Step {
    Continue,
    Finished(SessionOutcome),
}

pub struct SessionCoordinator {
    room: RoomClient,
    factory: Arc<dyn EngineFactory>,
    config: NegotiationConfig,
}

impl SessionCoordinator {
    pub fn new(
        room: RoomClient,
        factory: Arc<dyn EngineFactory>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            room,
            factory,
            config,
        }
    }

    /// Joins `room_id` and drives one session until the peer leaves, the
    /// connection drops, the first error surfaces or `shutdown` resolves.
    pub async fn run<S>(&self, room_id: &str, shutdown: S) -> Result<SessionSummary, SessionError>
    where
        S: Future<Output = ()>,
    {
        let params = self.room.join(room_id).await?;
        let role = NegotiationRole::from_initiator_flag(params.is_initiator);

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = match self.factory.create(&params, engine_tx).await {
            Ok(engine) => engine,
            Err(err) => {
                tracing::error!(target: "meet::session", error = %err, "engine setup failed");
                self.leave_room(&params).await;
                return Err(err.into());
            }
        };

        let (channel, mut channel_events) = SignalingChannel::spawn(self.room.http().clone());
        channel.connect(&params.channel_url, &params.channel_post_url);
        channel.register(&params.room_id, &params.client_id);

        let (negotiation, mut negotiation_events) =
            NegotiationController::spawn(engine, engine_rx, self.config.clone());
        negotiation.start(params.clone());

        tokio::pin!(shutdown);
        let mut connected = false;
        let result = loop {
            let step = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(target: "meet::session", "local shutdown requested");
                    Ok(Step::Finished(SessionOutcome::LocalShutdown))
                }
                event = channel_events.recv() => match event {
                    Some(event) => Self::on_channel_event(&negotiation, event),
                    None => Ok(Step::Finished(SessionOutcome::RemoteClosed)),
                },
                event = negotiation_events.recv() => match event {
                    Some(event) => {
                        self.on_negotiation_event(role, &params, &channel, &mut connected, event)
                            .await
                    }
                    None => Ok(Step::Finished(SessionOutcome::Disconnected)),
                },
            };
            match step {
                Ok(Step::Continue) => continue,
                Ok(Step::Finished(outcome)) => break Ok(outcome),
                Err(err) => break Err(err),
            }
        };

        channel.disconnect(true).await;
        self.leave_room(&params).await;
        negotiation.close().await;

        match result {
            Ok(outcome) => {
                tracing::info!(target: "meet::session", ?outcome, connected, "session ended");
                Ok(SessionSummary {
                    room_id: params.room_id,
                    client_id: params.client_id,
                    role,
                    outcome,
                    connected,
                })
            }
            Err(err) => {
                tracing::error!(target: "meet::session", error = %err, connected, "session failed");
                Err(err)
            }
        }
    }

    fn on_channel_event(
        negotiation: &NegotiationHandle,
        event: ChannelEvent,
    ) -> Result<Step, SessionError> {
        match event {
            ChannelEvent::RemoteDescription(desc) => negotiation.on_remote_description(desc),
            ChannelEvent::RemoteCandidate(candidate) => negotiation.on_remote_candidate(candidate),
            ChannelEvent::RemoteCandidatesRemoved(candidates) => {
                negotiation.on_remote_candidates_removed(candidates)
            }
            ChannelEvent::RemoteClosed => return Ok(Step::Finished(SessionOutcome::RemoteClosed)),
            ChannelEvent::Error(err) => return Err(err.into()),
        }
        Ok(Step::Continue)
    }

    async fn on_negotiation_event(
        &self,
        role: NegotiationRole,
        params: &SignalingParameters,
        channel: &SignalingChannel,
        connected: &mut bool,
        event: NegotiationEvent,
    ) -> Result<Step, SessionError> {
        let message = match event {
            NegotiationEvent::LocalDescription(desc) => SignalMessage::description(&desc),
            NegotiationEvent::LocalCandidate(candidate) => SignalMessage::Candidate(candidate),
            NegotiationEvent::LocalCandidatesRemoved(candidates) => {
                SignalMessage::RemoveCandidates { candidates }
            }
            NegotiationEvent::Connected => {
                tracing::info!(target: "meet::session", "media connection established");
                *connected = true;
                return Ok(Step::Continue);
            }
            NegotiationEvent::Disconnected => {
                return Ok(Step::Finished(SessionOutcome::Disconnected));
            }
            NegotiationEvent::Failed(err) => return Err(err.into()),
            NegotiationEvent::Closed => return Ok(Step::Finished(SessionOutcome::Disconnected)),
        };
        self.deliver(role, params, channel, message).await?;
        Ok(Step::Continue)
    }

    async fn deliver(
        &self,
        role: NegotiationRole,
        params: &SignalingParameters,
        channel: &SignalingChannel,
        message: SignalMessage,
    ) -> Result<(), ChannelError> {
        let route = DeliveryRoute::select(role, &message, channel.state());
        tracing::debug!(target: "meet::session", kind = message.kind(), ?route, "delivering message");
        match route {
            DeliveryRoute::RoomPost => self
                .room
                .post_message(&params.room_id, &params.client_id, &message)
                .await
                .map_err(|err| ChannelError::Delivery(err.to_string())),
            DeliveryRoute::Channel => {
                channel.send(message);
                Ok(())
            }
        }
    }

    async fn leave_room(&self, params: &SignalingParameters) {
        if let Err(err) = self.room.leave(&params.room_id, &params.client_id).await {
            tracing::warn!(target: "meet::session", error = %err, "leave request failed");
        }
    }
}
