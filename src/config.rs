use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::devices::Channel;
use crate::experiment::data::Layout;
use crate::experiment::storage::OutputFormat;
use crate::experiment::CampaignConfig;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "SCOPE_LOGGER_CONFIG";
/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "scope-logger.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which bus the instrument is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Visa,
    Tcp,
}

impl Transport {
    /// Whether this build can talk over the transport.
    pub fn is_available(self) -> bool {
        match self {
            Transport::Visa => cfg!(feature = "visa"),
            Transport::Tcp => true,
        }
    }
}

impl Default for Transport {
    /// VISA when the build links it, raw sockets otherwise.
    fn default() -> Self {
        if cfg!(feature = "visa") {
            Transport::Visa
        } else {
            Transport::Tcp
        }
    }
}

/// Session settings that are not asked for interactively.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub transport: Transport,
    /// VISA resource expression used for discovery.
    pub resource_filter: String,
    /// Candidate addresses tried when `transport` is `tcp`.
    pub tcp_addresses: Vec<String>,
    pub channel: u8,
    pub shunt_ohms: f64,
    pub timeout_ms: u64,
    pub inter_sample_delay_ms: u64,
    pub format: OutputFormat,
    pub layout: Layout,
    pub csv_file_name: String,
    pub log_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            resource_filter: "?*INSTR".to_string(),
            tcp_addresses: Vec::new(),
            channel: 1,
            shunt_ohms: 100.0,
            timeout_ms: 5000,
            inter_sample_delay_ms: 1000,
            format: OutputFormat::Workbook,
            layout: Layout::Derived,
            csv_file_name: "measurements.csv".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_json::from_str(text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, path)
    }

    /// `$SCOPE_LOGGER_CONFIG`, else `./scope-logger.json` if present.
    pub fn locate() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        local.is_file().then(|| local.to_path_buf())
    }

    /// Reads `path`, or validates the defaults when there is no file.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.shunt_ohms.is_finite() && self.shunt_ohms > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "shunt_ohms must be a positive number, got {}",
                self.shunt_ohms
            )));
        }
        if Channel::new(self.channel).is_none() {
            return Err(ConfigError::Invalid(format!(
                "channel must be between 1 and {}, got {}",
                Channel::COUNT,
                self.channel
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be non-zero".to_string()));
        }
        if self.csv_file_name.trim().is_empty() {
            return Err(ConfigError::Invalid("csv_file_name must not be empty".to_string()));
        }
        if !self.transport.is_available() {
            return Err(ConfigError::Invalid(
                "transport 'visa' is not enabled in this build; rebuild with --features visa \
                 or set \"transport\": \"tcp\""
                    .to_string(),
            ));
        }
        if self.transport == Transport::Tcp && self.tcp_addresses.is_empty() {
            return Err(ConfigError::Invalid(
                "transport 'tcp' needs at least one entry in tcp_addresses".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn campaign(&self, sample_count: usize) -> CampaignConfig {
        CampaignConfig {
            channel: Channel::new(self.channel).unwrap_or_default(),
            shunt_ohms: self.shunt_ohms,
            sample_count,
            inter_sample_delay: Duration::from_millis(self.inter_sample_delay_ms),
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<SessionConfig, ConfigError> {
        SessionConfig::from_json(text, Path::new("test.json"))
    }

    const TCP: &str = r#""transport": "tcp", "tcp_addresses": ["127.0.0.1:5025"]"#;

    #[test]
    fn unset_fields_take_defaults() {
        let config = parse(&format!("{{{TCP}}}")).unwrap();
        assert_eq!(
            config,
            SessionConfig {
                transport: Transport::Tcp,
                tcp_addresses: vec!["127.0.0.1:5025".to_string()],
                ..SessionConfig::default()
            }
        );
    }

    #[test]
    fn default_transport_is_available_in_this_build() {
        assert!(SessionConfig::default().transport.is_available());
        if cfg!(feature = "visa") {
            assert_eq!(Transport::default(), Transport::Visa);
            assert_eq!(parse("{}").unwrap(), SessionConfig::default());
        } else {
            assert_eq!(Transport::default(), Transport::Tcp);
            // Raw sockets cannot be scanned, so the defaults alone are not enough.
            assert!(matches!(parse("{}"), Err(ConfigError::Invalid(_))));
        }
    }

    #[cfg(not(feature = "visa"))]
    #[test]
    fn visa_transport_is_rejected_without_the_feature() {
        let err = parse(r#"{"transport": "visa"}"#).unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(msg) if msg.contains("not enabled")));
    }

    #[test]
    fn missing_file_falls_back_to_validated_defaults() {
        let loaded = SessionConfig::load_from(None);
        if cfg!(feature = "visa") {
            assert_eq!(loaded.unwrap(), SessionConfig::default());
        } else {
            assert!(matches!(loaded, Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn reads_partial_configuration() {
        let config = parse(
            r#"{
                "transport": "tcp",
                "tcp_addresses": ["TCPIP0::192.168.1.91::5025::SOCKET"],
                "channel": 2,
                "shunt_ohms": 10.0,
                "format": "csv",
                "layout": "basic"
            }"#,
        )
        .unwrap();
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.format, OutputFormat::Csv);
        assert_eq!(config.layout, Layout::Basic);
        assert_eq!(config.timeout_ms, 5000);

        let campaign = config.campaign(7);
        assert_eq!(campaign.channel.to_string(), "C2");
        assert_eq!(campaign.sample_count, 7);
        assert_eq!(campaign.inter_sample_delay, Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_values() {
        for field in [
            r#""shunt_ohms": 0"#,
            r#""shunt_ohms": -5.0"#,
            r#""channel": 5"#,
            r#""timeout_ms": 0"#,
            r#""csv_file_name": " ""#,
        ] {
            let text = format!("{{{TCP}, {field}}}");
            assert!(
                matches!(parse(&text), Err(ConfigError::Invalid(_))),
                "{text} should be rejected"
            );
        }
        assert!(matches!(parse(r#"{"transport": "tcp"}"#), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_json() {
        assert!(matches!(parse(r#"{"shunt": 100}"#), Err(ConfigError::Json { .. })));
        assert!(matches!(parse("{"), Err(ConfigError::Json { .. })));
    }

    #[test]
    fn reads_configuration_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, format!(r#"{{{TCP}, "inter_sample_delay_ms": 250}}"#)).unwrap();

        let config = SessionConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.inter_sample_delay_ms, 250);

        let missing = SessionConfig::from_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
