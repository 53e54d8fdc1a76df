//! Persistent websocket channel to the rendezvous service.
//!
//! One task owns the socket, the channel state and the error latch. Callers
//! talk to it through [`SignalingChannel`], which only posts commands; results
//! come back as [`ChannelEvent`]s and state changes through a watch channel.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::latch::ErrorLatch;
use crate::protocol::{
    ChannelCommand, ChannelEnvelope, IceCandidate, SessionDescription, SignalMessage,
};
use crate::room::one_shot;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connected,
    Registered,
    Closed,
    Error,
}

impl ChannelState {
    fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Error)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket transport failed: {0}")]
    Transport(String),
    #[error("malformed channel message: {0}")]
    Malformed(String),
    #[error("unexpected channel message type {0:?}")]
    UnexpectedType(String),
    #[error("room server reported error: {0}")]
    Server(String),
    #[error("message delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    RemoteDescription(SessionDescription),
    RemoteCandidate(IceCandidate),
    RemoteCandidatesRemoved(Vec<IceCandidate>),
    /// The peer said goodbye or the server closed the socket.
    RemoteClosed,
    Error(ChannelError),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

enum Command {
    Connect {
        channel_url: String,
        post_url: String,
    },
    Register {
        room_id: String,
        client_id: String,
    },
    Send(SignalMessage),
    Disconnect {
        send_leave: bool,
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the channel task.
#[derive(Clone)]
pub struct SignalingChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
}

impl SignalingChannel {
    pub fn spawn(http: Client) -> (Self, ChannelEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::New);
        let actor = ChannelActor {
            http,
            state: state_tx,
            post_url: None,
            registration: None,
            writer: None,
            latch: ErrorLatch::new(),
            events: events_tx,
        };
        tokio::spawn(actor.run(commands_rx));
        (
            Self {
                commands: commands_tx,
                state: state_rx,
            },
            events_rx,
        )
    }

    pub fn connect(&self, channel_url: impl Into<String>, post_url: impl Into<String>) {
        self.post(Command::Connect {
            channel_url: channel_url.into(),
            post_url: post_url.into(),
        });
    }

    pub fn register(&self, room_id: impl Into<String>, client_id: impl Into<String>) {
        self.post(Command::Register {
            room_id: room_id.into(),
            client_id: client_id.into(),
        });
    }

    pub fn send(&self, message: SignalMessage) {
        self.post(Command::Send(message));
    }

    /// Resolves once the socket is released. Safe to call repeatedly.
    pub async fn disconnect(&self, send_leave: bool) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect {
                send_leave,
                ack: ack_tx,
            })
            .is_err()
        {
            return;
        }
        let _ = ack_rx.await;
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(target: "meet::channel", "channel task gone; command dropped");
        }
    }
}

struct ChannelActor {
    http: Client,
    state: watch::Sender<ChannelState>,
    post_url: Option<String>,
    registration: Option<(String, String)>,
    writer: Option<WsWriter>,
    latch: ErrorLatch,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut reader: Option<WsReader> = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect { channel_url, post_url }) => {
                        reader = self.connect(&channel_url, post_url).await;
                    }
                    Some(Command::Register { room_id, client_id }) => {
                        self.register(room_id, client_id).await;
                    }
                    Some(Command::Send(message)) => self.send(&message).await,
                    Some(Command::Disconnect { send_leave, ack }) => {
                        reader = None;
                        self.disconnect(send_leave).await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.disconnect(false).await;
                        break;
                    }
                },
                frame = next_frame(&mut reader) => {
                    if !self.on_frame(frame) {
                        reader = None;
                    }
                }
            }
        }
        tracing::debug!(target: "meet::channel", "channel task stopped");
    }

    fn current(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(target: "meet::channel", from = ?previous, to = ?next, "channel state");
        }
    }

    async fn connect(&mut self, channel_url: &str, post_url: String) -> Option<WsReader> {
        if self.current() != ChannelState::New {
            tracing::warn!(target: "meet::channel", state = ?self.current(), "connect ignored");
            return None;
        }
        tracing::info!(target: "meet::channel", url = channel_url, "connecting signaling channel");
        self.post_url = Some(post_url);
        match connect_async(channel_url).await {
            Ok((stream, _)) => {
                let (writer, reader) = stream.split();
                self.writer = Some(writer);
                self.set_state(ChannelState::Connected);
                Some(reader)
            }
            Err(err) => {
                self.fail(ChannelError::Connect(err.to_string()));
                None
            }
        }
    }

    async fn register(&mut self, room_id: String, client_id: String) {
        if self.current() != ChannelState::Connected {
            tracing::warn!(target: "meet::channel", state = ?self.current(), "register outside connected state ignored");
            return;
        }
        let command = ChannelCommand::Register {
            roomid: room_id.clone(),
            clientid: client_id.clone(),
        };
        if self.write(&command).await {
            tracing::info!(target: "meet::channel", room_id = %room_id, client_id = %client_id, "channel registered");
            self.registration = Some((room_id, client_id));
            self.set_state(ChannelState::Registered);
        }
    }

    async fn send(&mut self, message: &SignalMessage) {
        if self.current() != ChannelState::Registered {
            tracing::warn!(
                target: "meet::channel",
                state = ?self.current(),
                kind = message.kind(),
                "send outside registered state dropped"
            );
            return;
        }
        let msg = match message.to_json() {
            Ok(msg) => msg,
            Err(err) => {
                self.fail(ChannelError::Malformed(err.to_string()));
                return;
            }
        };
        tracing::debug!(target: "meet::channel", kind = message.kind(), "sending message");
        self.write(&ChannelCommand::Send { msg }).await;
    }

    async fn write(&mut self, command: &ChannelCommand) -> bool {
        let text = match serde_json::to_string(command) {
            Ok(text) => text,
            Err(err) => {
                self.fail(ChannelError::Malformed(err.to_string()));
                return false;
            }
        };
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        match writer.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(err) => {
                self.fail(ChannelError::Transport(err.to_string()));
                false
            }
        }
    }

    async fn disconnect(&mut self, send_leave: bool) {
        let state = self.current();
        if send_leave && state == ChannelState::Registered {
            self.send(&SignalMessage::Bye).await;
            if let (Some(post_url), Some((room_id, client_id))) =
                (self.post_url.as_deref(), self.registration.as_ref())
            {
                let url = format!(
                    "{}/{}/{}",
                    post_url.trim_end_matches('/'),
                    room_id,
                    client_id
                );
                if let Err(err) = one_shot(&self.http, Method::DELETE, &url, None).await {
                    tracing::warn!(target: "meet::channel", error = %err, "channel leave request failed");
                }
            }
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.close().await {
                tracing::debug!(target: "meet::channel", error = %err, "websocket close failed");
            }
        }
        self.registration = None;
        if self.current() != ChannelState::Error {
            self.set_state(ChannelState::Closed);
        }
    }

    /// Handles one read result. Returns `false` once the read half is done.
    fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> bool {
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(err) => {
                    self.fail(ChannelError::Malformed(err.to_string()));
                    return true;
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                self.on_remote_close();
                return false;
            }
            Some(Ok(_)) => return true,
            Some(Err(err)) => {
                self.writer = None;
                self.fail(ChannelError::Transport(err.to_string()));
                return false;
            }
        };

        if self.current() != ChannelState::Registered {
            tracing::warn!(target: "meet::channel", state = ?self.current(), "message outside registered state rejected");
            return true;
        }
        tracing::trace!(target: "meet::channel", frame = %text, "inbound frame");
        match parse_inbound(&text) {
            Ok(ChannelEvent::RemoteClosed) => {
                tracing::info!(target: "meet::channel", "peer left the room");
                self.emit(ChannelEvent::RemoteClosed);
            }
            Ok(event) => self.emit(event),
            Err(err) => self.fail(err),
        }
        true
    }

    fn on_remote_close(&mut self) {
        let state = self.current();
        self.writer = None;
        if state.is_terminal() {
            return;
        }
        tracing::info!(target: "meet::channel", "websocket closed by server");
        self.set_state(ChannelState::Closed);
        self.emit(ChannelEvent::RemoteClosed);
    }

    fn fail(&mut self, err: ChannelError) {
        tracing::error!(target: "meet::channel", error = %err, "channel fault");
        if self.current() != ChannelState::Closed {
            self.set_state(ChannelState::Error);
        }
        if self.latch.trip() {
            self.emit(ChannelEvent::Error(err));
        } else {
            tracing::debug!(target: "meet::channel", "channel error already reported; suppressed");
        }
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(target: "meet::channel", "event receiver dropped");
        }
    }
}

async fn next_frame(
    reader: &mut Option<WsReader>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

/// Unwraps an inbound envelope into the event it carries.
pub fn parse_inbound(text: &str) -> Result<ChannelEvent, ChannelError> {
    let envelope: ChannelEnvelope =
        serde_json::from_str(text).map_err(|err| ChannelError::Malformed(err.to_string()))?;
    if !envelope.error.is_empty() {
        return Err(ChannelError::Server(envelope.error));
    }
    if envelope.msg.is_empty() {
        return Err(ChannelError::Malformed("empty msg field".into()));
    }

    let value: Value = serde_json::from_str(&envelope.msg)
        .map_err(|err| ChannelError::Malformed(err.to_string()))?;
    let kind = SignalMessage::peek_type(&value)
        .ok_or_else(|| ChannelError::Malformed("missing type".into()))?;
    if !SignalMessage::KNOWN_TYPES.contains(&kind) {
        return Err(ChannelError::UnexpectedType(kind.to_string()));
    }
    let message: SignalMessage =
        serde_json::from_value(value).map_err(|err| ChannelError::Malformed(err.to_string()))?;

    Ok(match message {
        SignalMessage::Candidate(candidate) => ChannelEvent::RemoteCandidate(candidate),
        SignalMessage::RemoveCandidates { candidates } => {
            ChannelEvent::RemoteCandidatesRemoved(candidates)
        }
        SignalMessage::Offer { sdp } => {
            ChannelEvent::RemoteDescription(SessionDescription::offer(sdp))
        }
        SignalMessage::Answer { sdp } => {
            ChannelEvent::RemoteDescription(SessionDescription::answer(sdp))
        }
        SignalMessage::Bye => ChannelEvent::RemoteClosed,
    })
}
