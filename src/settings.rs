use crate::bridge::{BridgeConfig, BridgeError};
use crate::channel::{MqttChannelOptions, MqttChannelOptionsBuilderError};
use crate::options::Schema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Configuration page, without query string.
    pub base_url: String,
    /// Title shown by the configuration page.
    pub title: String,
    pub schema: Schema,
    /// Directory holding the persisted options.
    pub store_dir: String,
    pub mqtt: MqttSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_url: String::from("http://panicman.github.io/config_nadir.html"),
            title: String::from("Nadir v2.0"),
            schema: Schema::WithSeconds,
            store_dir: String::from("."),
            mqtt: MqttSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub device_id: String,
    pub ack_timeout_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            host: String::from("localhost"),
            port: 1883,
            user: None,
            password: None,
            device_id: String::from("nadir"),
            ack_timeout_secs: 10,
        }
    }
}

impl Settings {
    /// Reads settings from `path`. An unreadable file falls back to the
    /// defaults; a file that is not valid settings JSON is an error.
    pub fn load(path: Option<&str>) -> Result<Settings, serde_json::Error> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content),
            Err(e) => {
                warn!("Failed to read settings file {path}: {e}, using default settings");
                Ok(Settings::default())
            }
        }
    }

    pub fn bridge_config(&self) -> Result<BridgeConfig, BridgeError> {
        BridgeConfig::new(&self.base_url, &self.title, self.schema)
    }

    pub fn channel_options(&self) -> Result<MqttChannelOptions, MqttChannelOptionsBuilderError> {
        MqttChannelOptions::builder()
            .host(self.mqtt.host.clone())
            .port(self.mqtt.port)
            .user(self.mqtt.user.clone())
            .password(self.mqtt.password.clone())
            .device_id(self.mqtt.device_id.clone())
            .ack_timeout(Duration::from_secs(self.mqtt.ack_timeout_secs))
            .schema(self.schema)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        let config = settings.bridge_config().unwrap();
        assert_eq!(
            config.configuration_url(None),
            "http://panicman.github.io/config_nadir.html?title=Nadir%20v2.0"
        );
        assert_eq!(config.schema, Schema::WithSeconds);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"schema":"without-seconds","mqtt":{"device_id":"watch-2"}}"#,
        )
        .unwrap();

        let settings = Settings::load(path.to_str()).unwrap();
        assert_eq!(settings.schema, Schema::WithoutSeconds);
        assert_eq!(settings.title, "Nadir v2.0");
        assert_eq!(settings.mqtt.device_id, "watch-2");
        assert_eq!(settings.mqtt.port, 1883);

        let options = settings.channel_options().unwrap();
        assert_eq!(options.schema, Schema::WithoutSeconds);
        assert_eq!(options.ack_topic(), "nadir/watch-2/ack");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.json");
        assert_eq!(Settings::load(path.to_str()).unwrap(), Settings::default());
        assert_eq!(Settings::load(None).unwrap(), Settings::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, r#"{"schema":"v3"}"#).unwrap();
        assert!(Settings::load(path.to_str()).is_err());
    }
}
