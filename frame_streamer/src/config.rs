use crate::{controller::StreamingSettings, encoder::Resolution};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

/// Bind address of the local status server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Duplex,
    RequestResponse,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: TransportMode,
    pub endpoint: Option<String>,
}

impl BackendConfig {
    pub fn get_endpoint(&self) -> String {
        match (&self.endpoint, self.mode) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, TransportMode::Duplex) => "ws://localhost:8000/ws".to_string(),
            (None, TransportMode::RequestResponse) => {
                "http://localhost:8000/process_frame".to_string()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    pub response_timeout_ms: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            response_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StreamingConfig {
    pub fn get_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Twice the interval unless configured.
    pub fn get_response_timeout(&self) -> Duration {
        self.response_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.get_interval() * 2)
    }

    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settings(&self) -> StreamingSettings {
        StreamingSettings::new(self.get_interval()).with_response_timeout(self.get_response_timeout())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EncoderConfig {
    #[serde(default)]
    pub fallback_resolution: Resolution,
    pub target_resolution: Option<Resolution>,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    92
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            fallback_resolution: Resolution::default(),
            target_resolution: None,
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic {
        #[serde(default)]
        resolution: Resolution,
    },
    StillImage {
        path: PathBuf,
    },
    Camera {
        #[serde(default)]
        device_index: i32,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            resolution: Resolution::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("FS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize::<Config>()
}
