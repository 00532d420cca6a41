//! Yardbird configuration
//!
//! Loaded from yardbird.toml (working directory, or an explicit path) with
//! env-var overrides. Env format: YARDBIRD__SECTION__KEY (double underscore
//! separators), e.g. `YARDBIRD__FRIGATE__MQTT_SERVER=broker.lan`.

use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub frigate: FrigateConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrigateConfig {
    /// Base URL of the Frigate instance, e.g. `http://frigate:5000`.
    pub frigate_url: String,
    /// Optional bearer token sent with every Frigate API call.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_main_topic")]
    pub main_topic: String,
    /// Cameras to monitor. Empty means every camera.
    #[serde(default)]
    pub cameras: Vec<String>,
    #[serde(default = "default_mqtt_server")]
    pub mqtt_server: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_auth: bool,
    #[serde(default)]
    pub mqtt_username: String,
    #[serde(default)]
    pub mqtt_password: String,
    #[serde(default)]
    pub mqtt_client_id: Option<String>,
    #[serde(default = "default_reconnect_secs")]
    pub mqtt_reconnect_secs: u64,
    /// Largest MQTT packet accepted from the broker, in bytes.
    #[serde(default = "default_max_packet_bytes")]
    pub mqtt_max_packet_bytes: usize,
    /// Timeout for snapshot and sub-label requests.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_main_topic() -> String {
    "frigate".to_string()
}
fn default_mqtt_server() -> String {
    "mqtt".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_reconnect_secs() -> u64 {
    5
}
fn default_max_packet_bytes() -> usize {
    256 * 1024
}
fn default_timeout_secs() -> u64 {
    10
}

impl FrigateConfig {
    /// Topic carrying Frigate event envelopes.
    pub fn events_topic(&self) -> String {
        format!("{}/events", self.main_topic.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierBackend {
    /// Inference server reached over HTTP.
    Remote,
    /// Local ONNX Runtime session (requires the `onnx` feature).
    Onnx,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationConfig {
    /// Coarse Frigate label that gates classification.
    #[serde(default = "default_subject_label")]
    pub subject_label: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_backend")]
    pub backend: ClassifierBackend,
    /// Inference endpoint for the remote backend.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_model_path")]
    pub model: String,
    #[serde(default = "default_labels_path")]
    pub labels: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_subject_label() -> String {
    "bird".to_string()
}
fn default_threshold() -> f32 {
    0.7
}
fn default_backend() -> ClassifierBackend {
    ClassifierBackend::Remote
}
fn default_model_path() -> String {
    "model.onnx".to_string()
}
fn default_labels_path() -> String {
    "labels.txt".to_string()
}
fn default_input_size() -> u32 {
    224
}
fn default_top_k() -> usize {
    5
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            subject_label: default_subject_label(),
            threshold: default_threshold(),
            backend: default_backend(),
            endpoint: None,
            model: default_model_path(),
            labels: default_labels_path(),
            input_size: default_input_size(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "yardbird.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl AppConfig {
    fn validate(self) -> Result<Self> {
        if self.frigate.frigate_url.trim().is_empty() {
            return Err(Error::InvalidConfig("frigate.frigate_url is empty".into()));
        }
        let threshold = self.classification.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "classification.threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        Ok(self)
    }
}

/// Load configuration from yardbird.toml + environment variable overrides.
///
/// Search order:
///   1. `path` if given (must exist), otherwise ./yardbird.toml (optional)
///   2. Environment variables: YARDBIRD__FRIGATE__FRIGATE_URL, etc.
///      `YARDBIRD__FRIGATE__CAMERAS` is a comma separated list.
pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    let file = match path {
        Some(p) => File::with_name(p).required(true),
        None => File::with_name("yardbird").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix("YARDBIRD")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("frigate.cameras")
            .try_parsing(true),
    );

    build(builder)
}

fn build(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<AppConfig> {
    let settings = builder.build()?;
    settings.try_deserialize::<AppConfig>()?.validate()
}
