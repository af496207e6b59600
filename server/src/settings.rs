//! Server configuration: defaults, optional JSON config file, CLI overrides.

use clap::Parser;
use rainstream_media::prelude::{
    MediaKind, RtpCodecCapability, TransportListenIp, WorkerLogLevel, WorkerLogTag,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read config file {path}: {error}")]
    ConfigFileRead { path: PathBuf, error: std::io::Error },
    #[error("cannot parse config file {path}: {error}")]
    ConfigFileParse {
        path: PathBuf,
        error: serde_json::Error,
    },
    #[error("invalid --logLevel: {0}")]
    InvalidLogLevel(String),
    #[error("invalid --logTag: {0}")]
    InvalidLogTag(String),
}

#[derive(Debug, Parser)]
#[command(about = "RainStream SFU signaling server")]
pub struct CliArgs {
    /// IP the server listens on.
    #[arg(long = "serverIP")]
    pub server_ip: Option<String>,
    /// Port the server listens on.
    #[arg(long = "serverPort")]
    pub server_port: Option<u16>,
    /// JSON configuration file, overridden by the other CLI options.
    #[arg(long = "configFile")]
    pub config_file: Option<PathBuf>,
    /// Media worker log level (debug, warn, error, none).
    #[arg(long = "logLevel")]
    pub log_level: Option<String>,
    /// Media worker log tag, repeatable.
    #[arg(long = "logTag")]
    pub log_tags: Vec<String>,
    /// Signaling coordinator URL a media server registers with.
    #[arg(long = "serverUrl")]
    pub server_url: Option<String>,
    /// Node id announced to the signaling coordinator.
    #[arg(long = "nodeId")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    pub certificate_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate_file: None,
            private_key_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettingsConfig {
    /// Path to the media worker binary.
    pub binary: PathBuf,
    /// Number of workers to prefork; rooms are assigned round-robin.
    pub num_workers: usize,
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerSettingsConfig {
    fn default() -> Self {
        Self {
            binary: "rainstream-worker".into(),
            num_workers: 2,
            log_level: "warn".to_string(),
            log_tags: vec!["info".to_string(), "ice".to_string()],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebRtcTransportSettings {
    pub listen_ips: Vec<TransportListenIp>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_sctp_message_size: u32,
    /// Applied best-effort after transport creation; failure is logged, not fatal.
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for WebRtcTransportSettings {
    fn default() -> Self {
        Self {
            listen_ips: vec![TransportListenIp {
                ip: "127.0.0.1".to_string(),
                announced_ip: None,
            }],
            initial_available_outgoing_bitrate: 1_000_000,
            max_sctp_message_size: 262_144,
            max_incoming_bitrate: Some(1_500_000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(skip)]
    pub server_ip: Option<String>,
    #[serde(skip)]
    pub server_port: Option<u16>,
    #[serde(skip)]
    pub server_url: Option<String>,
    #[serde(skip)]
    pub node_id: Option<String>,
    pub tls: TlsSettings,
    pub worker: WorkerSettingsConfig,
    pub router: RouterSettings,
    pub webrtc_transport: WebRtcTransportSettings,
}

impl Settings {
    pub fn load(args: &CliArgs) -> Result<Self, SettingsError> {
        let mut settings = match &args.config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|error| {
                    SettingsError::ConfigFileRead {
                        path: path.clone(),
                        error,
                    }
                })?;
                serde_json::from_str::<Settings>(&raw).map_err(|error| {
                    SettingsError::ConfigFileParse {
                        path: path.clone(),
                        error,
                    }
                })?
            }
            None => Settings::default(),
        };

        settings.server_ip = args.server_ip.clone();
        settings.server_port = args.server_port;
        settings.server_url = args.server_url.clone();
        settings.node_id = args.node_id.clone();

        if let Some(log_level) = &args.log_level {
            log_level
                .parse::<WorkerLogLevel>()
                .map_err(SettingsError::InvalidLogLevel)?;
            settings.worker.log_level = log_level.clone();
        }
        if !args.log_tags.is_empty() {
            for log_tag in &args.log_tags {
                log_tag
                    .parse::<WorkerLogTag>()
                    .map_err(SettingsError::InvalidLogTag)?;
            }
            settings.worker.log_tags = args.log_tags.clone();
        }

        Ok(settings)
    }

    pub fn listen_addr(&self) -> (String, u16) {
        (
            self.server_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
            self.server_port.unwrap_or(4443),
        )
    }

    pub fn worker_settings(&self) -> rainstream_media::prelude::WorkerSettings {
        let mut worker_settings = rainstream_media::prelude::WorkerSettings::default();
        worker_settings.log_level = self
            .worker
            .log_level
            .parse()
            .unwrap_or(WorkerLogLevel::Warn);
        worker_settings.log_tags = self
            .worker
            .log_tags
            .iter()
            .filter_map(|log_tag| log_tag.parse::<WorkerLogTag>().ok())
            .collect();
        worker_settings.rtc_min_port = self.worker.rtc_min_port;
        worker_settings.rtc_max_port = self.worker.rtc_max_port;
        worker_settings
    }
}

fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: json!({ "useinbandfec": 1 }),
            rtcp_feedback: vec![json!({ "type": "transport-cc" })],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: json!({}),
            rtcp_feedback: vec![
                json!({ "type": "nack" }),
                json!({ "type": "nack", "parameter": "pli" }),
                json!({ "type": "ccm", "parameter": "fir" }),
                json!({ "type": "goog-remb" }),
                json!({ "type": "transport-cc" }),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let settings = Settings::default();
        assert_eq!(settings.listen_addr(), ("0.0.0.0".to_string(), 4443));
        assert_eq!(settings.router.media_codecs.len(), 2);
        assert!(!settings.webrtc_transport.listen_ips.is_empty());
    }

    #[test]
    fn cli_overrides_apply() {
        let args = CliArgs {
            server_ip: Some("10.0.0.1".to_string()),
            server_port: Some(5000),
            config_file: None,
            log_level: Some("debug".to_string()),
            log_tags: vec!["rtp".to_string()],
            server_url: None,
            node_id: None,
        };

        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.listen_addr(), ("10.0.0.1".to_string(), 5000));
        assert_eq!(settings.worker.log_level, "debug");
        assert_eq!(settings.worker.log_tags, vec!["rtp".to_string()]);
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let args = CliArgs {
            server_ip: None,
            server_port: None,
            config_file: None,
            log_level: Some("loud".to_string()),
            log_tags: vec![],
            server_url: None,
            node_id: None,
        };

        assert!(matches!(
            Settings::load(&args),
            Err(SettingsError::InvalidLogLevel(_)),
        ));
    }
}
