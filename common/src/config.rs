use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Wi-Fi credentials from the `network` section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub ssid: String,
    pub password: String,
}

/// Broker settings from the `mqtt` section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub broker_ip: String,
    pub username: String,
    pub password: String,
    pub topic_pub: String,
    /// Seconds between published readings.
    pub msg_interval: u64,
    pub qos: u8,
}

/// Immutable device configuration, constructed once at boot from the
/// persisted JSON document. Every key is required; a missing or malformed
/// key fails the boot sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub network: NetworkSettings,
    pub mqtt: MqttSettings,
}

impl DeviceConfig {
    pub fn from_json(raw: &str) -> Result<Self, NodeError> {
        let config: DeviceConfig = serde_json::from_str(raw)
            .map_err(|err| NodeError::Config(format!("invalid config document: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), NodeError> {
        if self.network.ssid.trim().is_empty() {
            return Err(NodeError::Config("network.ssid cannot be empty".into()));
        }
        if self.mqtt.broker_ip.trim().is_empty() {
            return Err(NodeError::Config("mqtt.broker_ip cannot be empty".into()));
        }
        if self.mqtt.topic_pub.trim().is_empty() {
            return Err(NodeError::Config("mqtt.topic_pub cannot be empty".into()));
        }
        if self.mqtt.msg_interval == 0 {
            return Err(NodeError::Config(
                "mqtt.msg_interval must be at least 1 second".into(),
            ));
        }
        if self.mqtt.qos > 2 {
            return Err(NodeError::Config(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }
        Ok(())
    }
}

/// Client identifier derived from the hardware unique id (the station MAC),
/// as lowercase hex.
pub fn derive_client_id(unique_id: &[u8]) -> String {
    let mut id = String::with_capacity(unique_id.len() * 2);
    for byte in unique_id {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn full_config() -> &'static str {
        r#"{
            "network": {"ssid": "home-net", "password": "hunter2"},
            "mqtt": {
                "broker_ip": "192.168.1.20",
                "username": "logger",
                "password": "secret",
                "topic_pub": "home/bme280",
                "msg_interval": 60,
                "qos": 0
            }
        }"#
    }

    #[test]
    fn parses_full_document() {
        let config = DeviceConfig::from_json(full_config()).unwrap();

        assert_eq!(config.network.ssid, "home-net");
        assert_eq!(config.network.password, "hunter2");
        assert_eq!(config.mqtt.broker_ip, "192.168.1.20");
        assert_eq!(config.mqtt.topic_pub, "home/bme280");
        assert_eq!(config.mqtt.msg_interval, 60);
        assert_eq!(config.mqtt.qos, 0);
    }

    #[test]
    fn missing_key_is_fatal() {
        let raw = r#"{
            "network": {"ssid": "home-net", "password": "hunter2"},
            "mqtt": {
                "broker_ip": "192.168.1.20",
                "username": "logger",
                "password": "secret",
                "topic_pub": "home/bme280",
                "qos": 0
            }
        }"#;

        assert!(DeviceConfig::from_json(raw).is_err());
    }

    #[test]
    fn rejects_out_of_range_qos() {
        let raw = full_config().replace("\"qos\": 0", "\"qos\": 3");
        let err = DeviceConfig::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("qos"));
    }

    #[test]
    fn rejects_zero_interval() {
        let raw = full_config().replace("\"msg_interval\": 60", "\"msg_interval\": 0");
        assert!(DeviceConfig::from_json(&raw).is_err());
    }

    #[test]
    fn client_id_is_lowercase_hex_of_unique_id() {
        assert_eq!(derive_client_id(&[0xaa, 0x1b, 0x00, 0xff]), "aa1b00ff");
        assert_eq!(derive_client_id(&[]), "");
    }
}
