//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SMS_PULSAR_URL`, `SMS_CONSUL_TOKEN`,
//!    `SMS_LOG_LEVEL` (also respects the conventional `RUST_LOG`)
//! 2. **Config file** — path via `--config <path>`, or `config.yaml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The YAML file mirrors the struct hierarchy:
//!
//! ```yaml
//! name: sms
//! pulsar:
//!   url: "pulsar://localhost:6650"
//!   namespace: "echo-wing"
//! consul:
//!   host: "127.0.0.1"
//!   port: 8500
//!   scheme: "http"
//!   base: "echo_wing"
//! modem:
//!   baud_rate: 115200
//!   time_out: 30
//!   patterns:
//!     - "/dev/ttyUSB*"
//!     - "/dev/ttyACM*"
//!   usb_vid_pid: []
//! consumer:
//!   redelivery_threshold: 3
//!   negative_ack_delay_secs: 90
//!   ack_timeout_secs: 600
//!   receiver_queue_size: 1000
//! pool:
//!   health_check_interval_secs: 30
//!   error_threshold: 3
//!   session_init_timeout_secs: 30
//!   default_country_code: "+86"
//! logging:
//!   level: info
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::SmsError;

/// Top-level configuration, deserialized from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service identity — used in topic composition and the KV key.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub pulsar: PulsarConfig,
    #[serde(default)]
    pub consul: ConsulConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Message-bus connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PulsarConfig {
    #[serde(default = "default_pulsar_url")]
    pub url: String,
    /// Namespace used to compose `persistent://<namespace>/main/<name>`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub token: Option<String>,
}

/// Discovery/KV store settings for the schema publisher.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_host")]
    pub host: String,
    #[serde(default = "default_consul_port")]
    pub port: u16,
    pub token: Option<String>,
    #[serde(default = "default_consul_scheme")]
    pub scheme: String,
    #[serde(default = "default_consul_base")]
    pub base: String,
}

/// Serial/modem discovery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-session init timeout, seconds.
    #[serde(default = "default_time_out")]
    pub time_out: u64,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    /// `VID:PID` pairs for an optional `usbreset` at startup.
    #[serde(default)]
    pub usb_vid_pid: Vec<String>,
}

/// Consumer pipeline tunables (expansion — ambient, not in spec.md's
/// external-interface table but required for a runnable service).
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_redelivery_threshold")]
    pub redelivery_threshold: u32,
    #[serde(default = "default_negative_ack_delay_secs")]
    pub negative_ack_delay_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_receiver_queue_size")]
    pub receiver_queue_size: u32,
}

/// Modem pool tunables (expansion).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_session_init_timeout_secs")]
    pub session_init_timeout_secs: u64,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

/// Logging configuration (expansion).
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_name() -> String {
    "sms".to_string()
}
fn default_pulsar_url() -> String {
    "pulsar://localhost:6650".to_string()
}
fn default_namespace() -> String {
    "echo-wing".to_string()
}
fn default_consul_host() -> String {
    "127.0.0.1".to_string()
}
fn default_consul_port() -> u16 {
    8500
}
fn default_consul_scheme() -> String {
    "http".to_string()
}
fn default_consul_base() -> String {
    "echo_wing".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_time_out() -> u64 {
    30
}
fn default_patterns() -> Vec<String> {
    vec!["/dev/ttyUSB*".to_string(), "/dev/ttyACM*".to_string()]
}
fn default_redelivery_threshold() -> u32 {
    3
}
fn default_negative_ack_delay_secs() -> u64 {
    90
}
fn default_ack_timeout_secs() -> u64 {
    600
}
fn default_receiver_queue_size() -> u32 {
    1000
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_error_threshold() -> u32 {
    crate::session::ERROR_THRESHOLD
}
fn default_session_init_timeout_secs() -> u64 {
    30
}
fn default_country_code() -> String {
    "+86".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PulsarConfig {
    fn default() -> Self {
        Self {
            url: default_pulsar_url(),
            namespace: default_namespace(),
            token: None,
        }
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            host: default_consul_host(),
            port: default_consul_port(),
            token: None,
            scheme: default_consul_scheme(),
            base: default_consul_base(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            time_out: default_time_out(),
            patterns: default_patterns(),
            usb_vid_pid: Vec::new(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            redelivery_threshold: default_redelivery_threshold(),
            negative_ack_delay_secs: default_negative_ack_delay_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            receiver_queue_size: default_receiver_queue_size(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            error_threshold: default_error_threshold(),
            session_init_timeout_secs: default_session_init_timeout_secs(),
            default_country_code: default_country_code(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            pulsar: PulsarConfig::default(),
            consul: ConsulConfig::default(),
            modem: ModemConfig::default(),
            consumer: ConsumerConfig::default(),
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `config.yaml` in the current directory, falling back to compiled
    /// defaults. Returns `Err` on missing/unparseable explicit path so the
    /// orchestrator can exit non-zero rather than panic.
    pub fn load(path: Option<&str>) -> Result<Self, SmsError> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| SmsError::PayloadMalformed(format!("read config {p}: {e}")))?;
            serde_yaml::from_str(&content)
                .map_err(|e| SmsError::PayloadMalformed(format!("parse config {p}: {e}")))?
        } else if Path::new("config.yaml").exists() {
            let content = std::fs::read_to_string("config.yaml")
                .map_err(|e| SmsError::PayloadMalformed(format!("read config.yaml: {e}")))?;
            serde_yaml::from_str(&content)
                .map_err(|e| SmsError::PayloadMalformed(format!("parse config.yaml: {e}")))?
        } else {
            Config::default()
        };

        if let Ok(url) = std::env::var("SMS_PULSAR_URL") {
            config.pulsar.url = url;
        }
        if let Ok(token) = std::env::var("SMS_PULSAR_TOKEN") {
            config.pulsar.token = Some(token);
        }
        if let Ok(token) = std::env::var("SMS_CONSUL_TOKEN") {
            config.consul.token = Some(token);
        }
        if let Ok(level) = std::env::var("SMS_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// `persistent://<namespace>/main/<name>`.
    #[must_use]
    pub fn main_topic(&self) -> String {
        format!("persistent://{}/main/{}", self.pulsar.namespace, self.name)
    }

    /// `persistent://<namespace>/dlq/all`.
    #[must_use]
    pub fn dlq_topic(&self) -> String {
        format!("persistent://{}/dlq/all", self.pulsar.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_compose_expected_topic_names() {
        let config = Config::default();
        assert_eq!(config.main_topic(), "persistent://echo-wing/main/sms");
        assert_eq!(config.dlq_topic(), "persistent://echo-wing/dlq/all");
    }

    #[test]
    fn load_without_path_or_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("sms-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(&dir).unwrap();
        let result = Config::load(None);
        std::env::set_current_dir(cwd).unwrap();
        let config = result.unwrap();
        assert_eq!(config.name, "sms");
        assert_eq!(config.modem.baud_rate, 115_200);
    }

    #[test]
    fn load_with_missing_explicit_path_errs() {
        let result = Config::load(Some("/nonexistent/path/config.yaml"));
        assert!(result.is_err());
    }
}
