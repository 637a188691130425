//! Registry of known sensors, loaded from the device settings file.
//!
//! The settings file has one section per device, named by either the
//! device's hardware address or its ATC firmware name. INI is the default
//! format:
//!
//! ```ini
//! [A4:C1:38:0C:5B:45]
//! sensorname=edge of desk
//! topic=temperature/room
//!
//! [ATC_8B1F2A]
//! sensorname=kitchen
//! topic=temperature/kitchen
//! ```
//!
//! Files ending in `.toml` are read as TOML, with the same tables and fields
//! (section names containing `:` must be quoted there).
//!
//! Sections whose name is neither an address nor an ATC name are ignored.

use crate::device_id::{DeviceId, normalize};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Routing metadata for one configured sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    /// Human-readable sensor name, published as `sensorname`
    pub name: String,
    /// MQTT topic the sensor's readings are published to
    pub topic: String,
}

impl SensorInfo {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
        }
    }
}

/// Errors raised while loading the device settings file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read device settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse device settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to parse device settings: {0}")]
    Ini(#[from] ini::ParseError),
    #[error("device {id} has no {field}")]
    MissingField { id: String, field: &'static str },
    #[error("invalid settings for device {id}: {source}")]
    Section {
        id: String,
        source: toml::de::Error,
    },
    #[error("device {id} has an empty {field}")]
    EmptyField { id: String, field: &'static str },
    #[error("device {0} is configured more than once")]
    Duplicate(String),
}

#[derive(Debug, Deserialize)]
struct SensorSection {
    sensorname: String,
    topic: String,
}

/// Syntax of a device settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Ini,
    Toml,
}

impl SettingsFormat {
    /// TOML for `.toml` files, INI for anything else.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Ini,
        }
    }
}

/// Accumulates validated sections, rejecting duplicates.
#[derive(Debug, Default)]
struct RegistryBuilder {
    sensors: BTreeMap<DeviceId, SensorInfo>,
}

impl RegistryBuilder {
    /// The section's device identifier, or `None` when it names something else.
    fn device_id(name: &str) -> Option<DeviceId> {
        match name.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                debug!("Ignoring settings group '{}': not a device identifier", name);
                None
            }
        }
    }

    fn add(&mut self, name: &str, id: DeviceId, section: SensorSection) -> Result<(), ConfigError> {
        for (field, value) in [("sensorname", &section.sensorname), ("topic", &section.topic)] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    id: name.to_string(),
                    field,
                });
            }
        }

        let info = SensorInfo::new(section.sensorname.to_lowercase(), section.topic);
        if self.sensors.insert(id.clone(), info).is_some() {
            return Err(ConfigError::Duplicate(id.to_string()));
        }
        Ok(())
    }

    fn build(self) -> Registry {
        Registry {
            sensors: self.sensors,
        }
    }
}

/// Read-only mapping from device identifier to sensor routing metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    sensors: BTreeMap<DeviceId, SensorInfo>,
}

impl Registry {
    /// Load the registry from a settings file on disk, picking the format
    /// from the file extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        match SettingsFormat::from_path(path) {
            SettingsFormat::Ini => Self::from_ini(&content),
            SettingsFormat::Toml => content.parse(),
        }
    }

    /// Parse INI settings. Keys outside any section are ignored.
    pub fn from_ini(content: &str) -> Result<Self, ConfigError> {
        let file = ini::Ini::load_from_str(content)?;
        let mut builder = RegistryBuilder::default();

        for (name, properties) in file.iter() {
            let Some(name) = name else {
                continue;
            };
            let Some(id) = RegistryBuilder::device_id(name) else {
                continue;
            };

            let field = |field: &'static str| {
                properties
                    .get(field)
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::MissingField {
                        id: name.to_string(),
                        field,
                    })
            };
            let section = SensorSection {
                sensorname: field("sensorname")?,
                topic: field("topic")?,
            };
            builder.add(name, id, section)?;
        }

        Ok(builder.build())
    }

    /// Look up a sensor by identifier. The key is normalized before lookup.
    pub fn get(&self, key: &str) -> Option<&SensorInfo> {
        self.sensors.get(normalize(key).as_str())
    }

    /// Like [`Registry::get`], also returning the stored identifier.
    pub fn get_key_value(&self, key: &str) -> Option<(&DeviceId, &SensorInfo)> {
        self.sensors.get_key_value(normalize(key).as_str())
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, DeviceId, SensorInfo> {
        self.sensors.iter()
    }
}

/// Parses TOML settings.
impl FromStr for Registry {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let table: toml::Table = toml::from_str(content)?;
        let mut builder = RegistryBuilder::default();

        for (key, value) in table {
            let Some(id) = RegistryBuilder::device_id(&key) else {
                continue;
            };
            if !value.is_table() {
                debug!("Ignoring settings value '{}': not a table", key);
                continue;
            }

            let section: SensorSection = value
                .try_into()
                .map_err(|source| ConfigError::Section {
                    id: key.clone(),
                    source,
                })?;
            builder.add(&key, id, section)?;
        }

        Ok(builder.build())
    }
}

impl FromIterator<(DeviceId, SensorInfo)> for Registry {
    fn from_iter<I: IntoIterator<Item = (DeviceId, SensorInfo)>>(iter: I) -> Self {
        Self {
            sensors: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = (&'a DeviceId, &'a SensorInfo);
    type IntoIter = btree_map::Iter<'a, DeviceId, SensorInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.sensors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
        title = "not a device"

        ["A4:C1:38:0C:5B:45"]
        sensorname = "Edge of Desk"
        topic = "temperature/room"

        [ATC_8B1F2A]
        sensorname = "kitchen"
        topic = "temperature/kitchen"

        [mqtt]
        host = "localhost"
    "#;

    #[test]
    fn test_parse_registry() {
        let registry: Registry = SETTINGS.parse().unwrap();
        assert_eq!(registry.len(), 2);

        let desk = registry.get("a4:c1:38:0c:5b:45").unwrap();
        assert_eq!(desk.name, "edge of desk");
        assert_eq!(desk.topic, "temperature/room");

        let kitchen = registry.get("ATC_8B1F2A").unwrap();
        assert_eq!(kitchen.topic, "temperature/kitchen");
    }

    #[test]
    fn test_lookup_normalizes_key() {
        let registry: Registry = SETTINGS.parse().unwrap();
        assert!(registry.get("A4:C1:38:0C:5B:45").is_some());
        assert!(registry.get(" atc_8b1f2a ").is_some());
        assert!(registry.get("mqtt").is_none());
    }

    #[test]
    fn test_missing_topic_is_fatal() {
        let err = r#"
            ["A4:C1:38:0C:5B:45"]
            sensorname = "desk"
        "#
        .parse::<Registry>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Section { ref id, .. } if id == "A4:C1:38:0C:5B:45"));
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_missing_name_is_fatal() {
        let err = r#"
            [ATC_8B1F2A]
            topic = "temperature/kitchen"
        "#
        .parse::<Registry>()
        .unwrap_err();
        assert!(err.to_string().contains("sensorname"));
    }

    #[test]
    fn test_empty_topic_is_fatal() {
        let err = r#"
            [ATC_8B1F2A]
            sensorname = "kitchen"
            topic = " "
        "#
        .parse::<Registry>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField { field: "topic", .. }));
    }

    #[test]
    fn test_empty_name_is_fatal() {
        let err = r#"
            [ATC_8B1F2A]
            sensorname = ""
            topic = "temperature/kitchen"
        "#
        .parse::<Registry>()
        .unwrap_err();
        assert_eq!(err.to_string(), "device ATC_8B1F2A has an empty sensorname");
    }

    #[test]
    fn test_duplicate_after_normalization_is_fatal() {
        let err = r#"
            ["A4:C1:38:0C:5B:45"]
            sensorname = "one"
            topic = "a"

            ["a4:c1:38:0c:5b:45"]
            sensorname = "two"
            topic = "b"
        "#
        .parse::<Registry>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(ref id) if id == "a4:c1:38:0c:5b:45"));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            "[unterminated".parse::<Registry>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Registry::load("/nonexistent/devices.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    /// A settings file as deployed for the existing relay, byte for byte.
    const DEVICES_INI: &str = "[A4:C1:38:0C:5B:45]
sensorname=edge of desk
topic=temperature/room

[ATC_8B1F2A]
sensorname=Kitchen
topic=temperature/kitchen
";

    #[test]
    fn test_parse_ini_settings() {
        let registry = Registry::from_ini(DEVICES_INI).unwrap();
        assert_eq!(registry.len(), 2);

        let desk = registry.get("a4:c1:38:0c:5b:45").unwrap();
        assert_eq!(desk.name, "edge of desk");
        assert_eq!(desk.topic, "temperature/room");
        assert_eq!(registry.get("atc_8b1f2a").unwrap().name, "kitchen");
    }

    #[test]
    fn test_ini_ignores_other_sections() {
        let registry = Registry::from_ini(
            "log=debug\n\n[mqtt]\nhost=localhost\n\n[ATC_8B1F2A]\nsensorname=kitchen\ntopic=t\n",
        )
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("mqtt").is_none());
    }

    #[test]
    fn test_ini_missing_field_is_fatal() {
        let err = Registry::from_ini("[A4:C1:38:0C:5B:45]\nsensorname=desk\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField { field: "topic", ref id } if id == "A4:C1:38:0C:5B:45"
        ));

        let err = Registry::from_ini("[ATC_8B1F2A]\nsensorname=\ntopic=t\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField { field: "sensorname", .. }));
    }

    #[test]
    fn test_settings_format_from_extension() {
        assert_eq!(
            SettingsFormat::from_path(Path::new("devices.ini")),
            SettingsFormat::Ini
        );
        assert_eq!(
            SettingsFormat::from_path(Path::new("/etc/relay/devices.TOML")),
            SettingsFormat::Toml
        );
        assert_eq!(
            SettingsFormat::from_path(Path::new("devices")),
            SettingsFormat::Ini
        );
    }

    #[test]
    fn test_load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();

        let ini_path = dir.path().join("devices.ini");
        std::fs::write(&ini_path, DEVICES_INI).unwrap();
        let from_ini = Registry::load(&ini_path).unwrap();

        let toml_path = dir.path().join("devices.toml");
        std::fs::write(&toml_path, SETTINGS).unwrap();
        let from_toml = Registry::load(&toml_path).unwrap();

        assert_eq!(
            from_ini.get("a4:c1:38:0c:5b:45"),
            from_toml.get("a4:c1:38:0c:5b:45")
        );
        assert!(matches!(
            Registry::load(dir.path().join("missing.ini")),
            Err(ConfigError::Read { .. })
        ));
    }
}
