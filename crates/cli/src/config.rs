//! TOML configuration for the server binary.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:554"
//! public_host = "192.168.1.20"
//! fps = 30
//!
//! [camera]
//! width = 1920
//! height = 1080
//!
//! [rtsp_encoder]
//! i_period = 30
//! bitrate = 4000000
//!
//! [usb_encoder]
//! jpeg_quality = 90
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use std::path::Path;
use std::time::Duration;

use dualcam::ArbiterConfig;
use dualcam::ServerConfig;
use dualcam::device::EncoderParams;
use dualcam::relay::DEFAULT_RELAY_CAPACITY;
use dualcam::stream::OrchestratorConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub camera: CameraSection,
    /// H.264 settings when the RTSP path drives the encoder.
    pub rtsp_encoder: EncoderSection,
    /// Encoder settings for USB sessions.
    pub usb_encoder: EncoderSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
    pub public_host: Option<String>,
    pub session_name: String,
    pub client_timeout_secs: u64,
    pub mtu: usize,
    pub fps: u32,
    pub relay_capacity: usize,
    pub handoff_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            bind: server.bind_addr,
            public_host: None,
            session_name: server.sdp_session_name,
            client_timeout_secs: server.client_timeout.as_secs(),
            mtu: server.mtu,
            fps: server.fps,
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            handoff_timeout_ms: ArbiterConfig::default().handoff_timeout.as_millis() as u64,
        }
    }
}

/// Native sensor mode of the simulated camera.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraSection {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderSection {
    pub i_period: Option<u32>,
    pub bitrate: Option<u32>,
    pub min_qp: Option<u8>,
    pub max_qp: Option<u8>,
    pub jpeg_quality: Option<u8>,
}

impl From<EncoderSection> for EncoderParams {
    fn from(section: EncoderSection) -> Self {
        EncoderParams {
            i_period: section.i_period,
            bitrate: section.bitrate,
            min_qp: section.min_qp,
            max_qp: section.max_qp,
            jpeg_quality: section.jpeg_quality,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 || camera.width % 2 != 0 || camera.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "camera size {}x{} must be non-zero and even",
                camera.width, camera.height
            )));
        }
        if camera.fps == 0 || self.server.fps == 0 {
            return Err(ConfigError::Invalid("frame rate must be non-zero".into()));
        }
        if self.server.mtu < 64 {
            return Err(ConfigError::Invalid(format!(
                "mtu {} is too small",
                self.server.mtu
            )));
        }
        if self.server.relay_capacity == 0 {
            return Err(ConfigError::Invalid("relay capacity must be non-zero".into()));
        }
        for (name, section) in [("rtsp_encoder", &self.rtsp_encoder), ("usb_encoder", &self.usb_encoder)] {
            if let Some(q) = section.jpeg_quality
                && !(1..=100).contains(&q)
            {
                return Err(ConfigError::Invalid(format!("{name}.jpeg_quality {q} not in 1..=100")));
            }
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server.bind.clone(),
            public_host: self.server.public_host.clone(),
            sdp_session_name: self.server.session_name.clone(),
            client_timeout: Duration::from_secs(self.server.client_timeout_secs),
            mtu: self.server.mtu,
            fps: self.server.fps,
            encoder: self.rtsp_encoder.into(),
            ..Default::default()
        }
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            handoff_timeout: Duration::from_millis(self.server.handoff_timeout_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            h264: self.usb_encoder.into(),
            jpeg: self.usb_encoder.into(),
        }
    }
}
