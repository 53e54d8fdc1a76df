use std::env;
#[cfg(test)]
use std::sync::Mutex;

use thiserror::Error;
use url::Url;

use crate::engine::MediaConstraints;

pub const DEFAULT_ROOM_SERVER: &str = "https://appr.tc";
pub const DEFAULT_VIDEO_CODEC: &str = "VP8";
pub const DEFAULT_AUDIO_CODEC: &str = "opus";
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid room server url {value:?}: {source}")]
    InvalidServer {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("room server url {0:?} must use http or https")]
    UnsupportedScheme(String),
}

/// Codec and bitrate policy applied by the negotiation controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationConfig {
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_start_bitrate_kbps: u32,
    pub constraints: MediaConstraints,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            audio_start_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
            constraints: MediaConstraints::default(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Rendezvous service base address
    pub room_server: String,
    pub negotiation: NegotiationConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let room_server = non_empty_var("MEET_ROOM_SERVER")
            .unwrap_or_else(|| DEFAULT_ROOM_SERVER.to_string());
        let video_codec =
            non_empty_var("MEET_VIDEO_CODEC").unwrap_or_else(|| DEFAULT_VIDEO_CODEC.to_string());
        let audio_codec =
            non_empty_var("MEET_AUDIO_CODEC").unwrap_or_else(|| DEFAULT_AUDIO_CODEC.to_string());
        let audio_start_bitrate_kbps = match non_empty_var("MEET_AUDIO_BITRATE_KBPS") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(kbps) if kbps > 0 => kbps,
                _ => {
                    tracing::warn!(
                        target: "meet::config",
                        value = %raw,
                        default = DEFAULT_AUDIO_BITRATE_KBPS,
                        "invalid MEET_AUDIO_BITRATE_KBPS; using default"
                    );
                    DEFAULT_AUDIO_BITRATE_KBPS
                }
            },
            None => DEFAULT_AUDIO_BITRATE_KBPS,
        };

        Self {
            room_server,
            negotiation: NegotiationConfig {
                video_codec,
                audio_codec,
                audio_start_bitrate_kbps,
                constraints: MediaConstraints::default(),
            },
        }
    }

    pub fn with_room_server(mut self, room_server: impl Into<String>) -> Self {
        self.room_server = room_server.into();
        self
    }

    /// Parsed rendezvous base URL with any trailing slash removed from the
    /// path so endpoint paths can be appended.
    pub fn room_server_url(&self) -> Result<Url, ConfigError> {
        let trimmed = self.room_server.trim_end_matches('/');
        let url = Url::parse(trimmed).map_err(|source| ConfigError::InvalidServer {
            value: self.room_server.clone(),
            source,
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            _ => Err(ConfigError::UnsupportedScheme(self.room_server.clone())),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room_server: DEFAULT_ROOM_SERVER.to_string(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
