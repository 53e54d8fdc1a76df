//! HTTP side of the rendezvous service: the room join handshake, per-room
//! message delivery and the leave notification.
//!
//! Every request here is a single attempt. Retrying is left to the caller.

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::protocol::{IceServer, SessionDescription, SignalMessage, SignalingParameters};

const RESULT_SUCCESS: &str = "SUCCESS";

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected join status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("room server refused join: {0}")]
    Refused(String),
    #[error("malformed join response: {0}")]
    Malformed(String),
    #[error("ice server request failed: {0}")]
    IceServers(#[source] DeliveryError),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("delivery rejected by room server: {0}")]
    Rejected(String),
    #[error("malformed delivery response: {0}")]
    Malformed(String),
    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Single-attempt request helper shared by the room client and the signaling
/// channel. Returns the response body; a non-success status is an error.
pub async fn one_shot(
    http: &Client,
    method: Method,
    url: &str,
    body: Option<String>,
) -> Result<String, DeliveryError> {
    tracing::debug!(target: "meet::room", %method, url, has_body = body.is_some(), "one-shot request");
    let mut request = http.request(method.clone(), url);
    if let Some(body) = body {
        request = request
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
    }
    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;
    tracing::trace!(target: "meet::room", %method, url, %status, body = %text, "one-shot response");
    if status.is_success() {
        Ok(text)
    } else {
        Err(DeliveryError::UnexpectedStatus { status, body: text })
    }
}

/// Checks the `result` discriminator of a message response. Anything other
/// than `{"result":"SUCCESS"}` is a delivery error.
pub fn check_result(body: &str) -> Result<(), DeliveryError> {
    #[derive(Deserialize)]
    struct ResultOnly {
        result: Option<String>,
    }
    let parsed: ResultOnly = serde_json::from_str(body)
        .map_err(|err| DeliveryError::Malformed(format!("{err}: {body:?}")))?;
    match parsed.result.as_deref() {
        Some(RESULT_SUCCESS) => Ok(()),
        Some(other) => Err(DeliveryError::Rejected(other.to_string())),
        None => Err(DeliveryError::Malformed(format!("missing result: {body}"))),
    }
}

#[derive(Clone)]
pub struct RoomClient {
    http: Client,
    base_url: String,
}

impl RoomClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let url = config.room_server_url()?;
        Ok(Self::new(url.as_str()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub fn join_url(&self, room_id: &str) -> String {
        format!("{}/join/{}", self.base_url, room_id)
    }

    pub fn message_url(&self, room_id: &str, client_id: &str) -> String {
        format!("{}/message/{}/{}", self.base_url, room_id, client_id)
    }

    pub fn leave_url(&self, room_id: &str, client_id: &str) -> String {
        format!("{}/leave/{}/{}", self.base_url, room_id, client_id)
    }

    /// Exchanges a room id for the parameters of one session.
    pub async fn join(&self, room_id: &str) -> Result<SignalingParameters, JoinError> {
        let url = self.join_url(room_id);
        tracing::info!(target: "meet::room", room_id, url = %url, "joining room");
        let response = self.http.post(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::warn!(target: "meet::room", %status, "join rejected");
            return Err(JoinError::UnexpectedStatus { status, body });
        }

        let (mut parameters, ice_server_url) = parse_join_response(&body)?;
        if !parameters.ice_servers.iter().any(IceServer::is_turn) {
            if let Some(ice_url) = ice_server_url.filter(|url| !url.is_empty()) {
                let extra = self.fetch_ice_servers(&ice_url).await?;
                tracing::debug!(target: "meet::room", count = extra.len(), "fetched turn servers");
                parameters.ice_servers.extend(extra);
            }
        }

        tracing::info!(
            target: "meet::room",
            room_id = %parameters.room_id,
            client_id = %parameters.client_id,
            initiator = parameters.is_initiator,
            ice_servers = parameters.ice_servers.len(),
            initial_candidates = parameters.initial_candidates.len(),
            has_offer = parameters.initial_offer.is_some(),
            "joined room"
        );
        Ok(parameters)
    }

    async fn fetch_ice_servers(&self, url: &str) -> Result<Vec<IceServer>, JoinError> {
        let body = one_shot(&self.http, Method::POST, url, None)
            .await
            .map_err(JoinError::IceServers)?;
        let config: PcConfig = serde_json::from_str(&body)
            .map_err(|err| JoinError::Malformed(format!("ice server response: {err}")))?;
        Ok(config.ice_servers)
    }

    /// Delivers one typed message through the per-room message endpoint.
    pub async fn post_message(
        &self,
        room_id: &str,
        client_id: &str,
        message: &SignalMessage,
    ) -> Result<(), DeliveryError> {
        let body = message.to_json()?;
        let url = self.message_url(room_id, client_id);
        let response = one_shot(&self.http, Method::POST, &url, Some(body)).await?;
        check_result(&response)
    }

    /// Notifies the room server that this client left. The response body
    /// carries nothing, so only the status is checked.
    pub async fn leave(&self, room_id: &str, client_id: &str) -> Result<(), DeliveryError> {
        let url = self.leave_url(room_id, client_id);
        tracing::debug!(target: "meet::room", room_id, client_id, "leaving room");
        one_shot(&self.http, Method::POST, &url, None).await.map(drop)
    }
}

#[derive(Deserialize)]
struct JoinResponse {
    result: String,
    #[serde(default)]
    params: Option<JoinParams>,
}

#[derive(Deserialize)]
struct JoinParams {
    room_id: String,
    client_id: String,
    is_initiator: Value,
    wss_url: String,
    wss_post_url: String,
    #[serde(default)]
    pc_config: Option<Value>,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    ice_server_url: Option<String>,
}

#[derive(Deserialize, Default)]
struct PcConfig {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<IceServer>,
}

/// Parses a join response body. The second value is the optional URL from
/// which extra TURN servers can be requested.
pub(crate) fn parse_join_response(
    body: &str,
) -> Result<(SignalingParameters, Option<String>), JoinError> {
    let response: JoinResponse =
        serde_json::from_str(body).map_err(|err| JoinError::Malformed(err.to_string()))?;
    if response.result != RESULT_SUCCESS {
        return Err(JoinError::Refused(response.result));
    }
    let params = response
        .params
        .ok_or_else(|| JoinError::Malformed("missing params".into()))?;

    let is_initiator = parse_flag(&params.is_initiator)
        .ok_or_else(|| JoinError::Malformed(format!("is_initiator = {}", params.is_initiator)))?;
    let ice_servers = match params.pc_config {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(text)) => {
            serde_json::from_str::<PcConfig>(&text)
                .map_err(|err| JoinError::Malformed(format!("pc_config: {err}")))?
                .ice_servers
        }
        Some(value) => {
            serde_json::from_value::<PcConfig>(value)
                .map_err(|err| JoinError::Malformed(format!("pc_config: {err}")))?
                .ice_servers
        }
    };

    let mut initial_offer = None;
    let mut initial_candidates = Vec::new();
    // Stored messages only matter to the side that has to answer.
    if !is_initiator {
        for raw in params.messages {
            let value = match raw {
                Value::String(text) => serde_json::from_str::<Value>(&text)
                    .map_err(|err| JoinError::Malformed(format!("stored message: {err}")))?,
                other => other,
            };
            let message: SignalMessage = serde_json::from_value(value)
                .map_err(|err| JoinError::Malformed(format!("stored message: {err}")))?;
            match message {
                SignalMessage::Offer { sdp } => {
                    initial_offer = Some(SessionDescription::offer(sdp));
                }
                SignalMessage::Candidate(candidate) => initial_candidates.push(candidate),
                other => {
                    return Err(JoinError::Malformed(format!(
                        "unexpected stored message type {}",
                        other.kind()
                    )));
                }
            }
        }
    }

    let parameters = SignalingParameters {
        room_id: params.room_id,
        client_id: params.client_id,
        is_initiator,
        ice_servers,
        initial_offer,
        initial_candidates,
        channel_url: params.wss_url,
        channel_post_url: params.wss_post_url,
    };
    Ok((parameters, params.ice_server_url))
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
