use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use crate::error::ConfigError;
use crate::media::MediaConstraints;
use crate::utils::add_ice_url_scheme;

// Logging is on by default only in debug builds.
#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "message_channel";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// env_logger filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            level: "info".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Empty by default: both peers live in this process and only need host candidates.
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConstraints,
    pub data_channel_label: String,
    /// Per negotiation step; 0 waits forever.
    pub negotiation_timeout_secs: u64,
    /// How long `send_message` waits for the data channel to open; 0 waits forever.
    pub send_timeout_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            media: MediaConstraints::default(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            negotiation_timeout_secs: 10,
            send_timeout_secs: 10,
            logging: LoggingConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from("loopcall.toml")
    }

    /// Load configuration from a TOML file; a missing file yields the defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: CallConfig = toml::from_str(&contents)?;
        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server '{}' has an empty url",
                    server.id
                )));
            }

            if server.kind == ServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }

        if self.data_channel_label.is_empty() {
            return Err(ConfigError::Invalid(
                "data channel label cannot be empty".to_string(),
            ));
        }

        if !self.media.audio && !self.media.video {
            return Err(ConfigError::Invalid(
                "media constraints must request audio or video".to_string(),
            ));
        }

        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.negotiation_timeout_secs)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.send_timeout_secs)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![add_ice_url_scheme(server)],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect()
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.rtc_ice_servers(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
