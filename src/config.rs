use crate::agent::Agent;
use crate::defaults;
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionSection,
    pub transport: TransportSection,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    pub default_agent: Agent,
    pub connect_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    pub error_retry_budget: u32,
}

/// Backend transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSection {
    pub url: String,
    pub inbound_buffer: usize,
    pub send_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub chunk_ms: u64,
    pub acquire_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_agent: Agent::Triage,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            transfer_timeout_ms: defaults::TRANSFER_TIMEOUT_MS,
            error_retry_budget: defaults::ERROR_RETRY_BUDGET,
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            url: defaults::BACKEND_URL.to_string(),
            inbound_buffer: defaults::INBOUND_BUFFER,
            send_timeout_ms: defaults::SEND_TIMEOUT_MS,
            close_timeout_ms: defaults::CLOSE_TIMEOUT_MS,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            chunk_ms: defaults::CHUNK_MS,
            acquire_timeout_ms: defaults::ACQUIRE_TIMEOUT_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

impl SessionSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

impl TransportSection {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl AudioConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - MEDVOICE_URL → transport.url
    /// - MEDVOICE_AUDIO_DEVICE → audio.device
    /// - MEDVOICE_AGENT → session.default_agent (ignored if not a known agent)
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("MEDVOICE_URL")
            && !url.is_empty()
        {
            self.transport.url = url;
        }

        if let Ok(device) = std::env::var("MEDVOICE_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(agent) = std::env::var("MEDVOICE_AGENT")
            && let Ok(agent) = agent.parse::<Agent>()
        {
            self.session.default_agent = agent;
        }

        self
    }

    /// Reject values that would make a session unusable.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session.connect_timeout_ms", self.session.connect_timeout_ms),
            (
                "session.transfer_timeout_ms",
                self.session.transfer_timeout_ms,
            ),
            ("transport.send_timeout_ms", self.transport.send_timeout_ms),
            ("transport.close_timeout_ms", self.transport.close_timeout_ms),
            ("audio.chunk_ms", self.audio.chunk_ms),
            ("audio.acquire_timeout_ms", self.audio.acquire_timeout_ms),
            ("audio.sample_rate", u64::from(self.audio.sample_rate)),
            ("transport.inbound_buffer", self.transport.inbound_buffer as u64),
        ];

        for (key, value) in positive {
            if value == 0 {
                return Err(VoiceError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err(VoiceError::ConfigInvalidValue {
                key: "transport.url".to_string(),
                message: format!("expected a ws:// or wss:// URL, got '{}'", self.transport.url),
            });
        }

        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/medvoice/config.toml on Linux
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("medvoice").join("config.toml"))
            .ok_or_else(|| VoiceError::ConfigFileNotFound {
                path: "<no config directory>".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Serializes tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: only used with ENV_LOCK held.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_medvoice_env() {
        remove_env("MEDVOICE_URL");
        remove_env("MEDVOICE_AUDIO_DEVICE");
        remove_env("MEDVOICE_AGENT");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.session.default_agent, Agent::Triage);
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.transfer_timeout(), Duration::from_secs(8));
        assert_eq!(config.session.error_retry_budget, 3);

        assert_eq!(config.transport.url, "ws://127.0.0.1:8787/voice");
        assert_eq!(config.transport.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.transport.close_timeout(), Duration::from_secs(1));

        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.chunk_interval(), Duration::from_millis(250));

        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [session]
            default_agent = "support"
            connect_timeout_ms = 5000
            transfer_timeout_ms = 2000

            [transport]
            url = "wss://clinic.example/voice"
            send_timeout_ms = 750

            [audio]
            device = "pipewire"
            chunk_ms = 100

            [logging]
            level = "debug"
            json = true
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.session.default_agent, Agent::Support);
        assert_eq!(config.session.connect_timeout_ms, 5000);
        assert_eq!(config.session.transfer_timeout_ms, 2000);
        assert_eq!(config.transport.url, "wss://clinic.example/voice");
        assert_eq!(config.transport.send_timeout_ms, 750);
        assert_eq!(config.audio.device, Some("pipewire".to_string()));
        assert_eq!(config.audio.chunk_ms, 100);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);

        // Untouched fields keep their defaults
        assert_eq!(config.session.error_retry_budget, 3);
        assert_eq!(config.transport.close_timeout_ms, 1000);
        assert_eq!(config.audio.sample_rate, 16000);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_rejects_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[session\nbroken").unwrap();
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_unknown_agent_in_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[session]\ndefault_agent = \"radiology\"\n")
            .unwrap();
        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.session.connect_timeout_ms = 0;
        match config.validate() {
            Err(VoiceError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "session.connect_timeout_ms");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_send_timeout() {
        let mut config = Config::default();
        config.transport.send_timeout_ms = 0;
        match config.validate() {
            Err(VoiceError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "transport.send_timeout_ms");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_http_url() {
        let mut config = Config::default();
        config.transport.url = "http://clinic.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_medvoice_env();

        set_env("MEDVOICE_URL", "ws://10.0.0.2:9000/voice");
        set_env("MEDVOICE_AUDIO_DEVICE", "hw:1,0");
        set_env("MEDVOICE_AGENT", "billing");

        let config = Config::default().with_env_overrides();
        assert_eq!(config.transport.url, "ws://10.0.0.2:9000/voice");
        assert_eq!(config.audio.device, Some("hw:1,0".to_string()));
        assert_eq!(config.session.default_agent, Agent::Billing);

        clear_medvoice_env();
    }

    #[test]
    fn test_env_override_ignores_unknown_agent_and_empty_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_medvoice_env();

        set_env("MEDVOICE_URL", "");
        set_env("MEDVOICE_AGENT", "radiology");

        let config = Config::default().with_env_overrides();
        assert_eq!(config, Config::default());

        clear_medvoice_env();
    }
}
