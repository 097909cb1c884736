//! Hook configuration, read once at bootstrap from a JSON file.

use crate::card::{CardId, CardType};
use crate::eamuse::ServerAddr;
use crate::emu::chart_patch::TIMEBASE_9_TO_13;
use crate::security::{Mcode, SecurityId, TokenSeed};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "DEVHOOK_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "devhook.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub security: SecurityConfig,
    pub eamuse: EamuseConfig,
    pub ezusb: EzusbConfig,
    pub card_reader: CardReaderConfig,
    pub settings: SettingsConfig,
    pub chart_patch: ChartPatchConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when neither `DEVHOOK_LOG` nor `RUST_LOG`
    /// is set.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub boot_version: String,
    pub boot_seeds: [u32; 3],
    pub black_mcode: String,
    pub white_mcode: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            boot_version: "GQC02JAA".to_string(),
            boot_seeds: [0, 0, 0],
            black_mcode: "GQC02JAA".to_string(),
            white_mcode: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EamuseConfig {
    pub server: String,
    pub pcbid: String,
    pub eamid: String,
}

impl Default for EamuseConfig {
    fn default() -> Self {
        Self {
            server: "localhost:80".to_string(),
            pcbid: "0101020304050607086F".to_string(),
            eamid: "0101020304050607086F".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EzusbConfig {
    pub enabled: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_alias: String,
    /// `iidxio` library driving panel inputs and lamps; idle inputs when
    /// unset.
    pub io_library: Option<PathBuf>,
}

impl Default for EzusbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vendor_id: 0x0547,
            product_id: 0x2750,
            device_alias: r"\\.\Ezusb-0".to_string(),
            io_library: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardSlotConfig {
    pub enabled: bool,
    pub card_type: CardType,
}

impl Default for CardSlotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            card_type: CardType::Iso15693,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardReaderConfig {
    pub enabled: bool,
    pub port: String,
    pub slots: Vec<CardSlotConfig>,
    /// One id per slot, 16 hex digits; empty means no card.
    pub cards: Vec<String>,
    /// `eamio` library to poll instead of the fixed ids.
    pub eamio_library: Option<PathBuf>,
}

impl Default for CardReaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "COM1".to_string(),
            slots: vec![CardSlotConfig::default(); 2],
            cards: Vec::new(),
            eamio_library: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub enabled: bool,
    pub root: PathBuf,
    pub drives: Vec<String>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("settings"),
            drives: vec![r"d:\".to_string(), r"e:\".to_string(), r"f:\".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartPatchConfig {
    pub enabled: bool,
    pub timebase: f64,
    /// Fixed refresh rate; otherwise one must be published at runtime.
    pub refresh_rate: Option<f64>,
}

impl Default for ChartPatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timebase: TIMEBASE_9_TO_13,
            refresh_rate: None,
        }
    }
}

impl Config {
    /// Load from `$DEVHOOK_CONFIG`, else `devhook.json`. A missing file
    /// yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token_seed()?;
        self.server_addr()?;

        if self.ezusb.enabled && self.ezusb.vendor_id == 0 {
            return Err(ConfigError::invalid("ezusb.vendor_id", "must not be zero"));
        }

        if self.card_reader.enabled {
            if self.card_reader.port.is_empty() {
                return Err(ConfigError::invalid("card_reader.port", "must not be empty"));
            }
            self.card_ids()?;
        }

        if self.settings.enabled {
            for drive in &self.settings.drives {
                let mut chars = drive.chars();
                let valid = matches!(
                    (chars.next(), chars.next()),
                    (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
                );
                if !valid {
                    return Err(ConfigError::invalid(
                        "settings.drives",
                        format!("{:?} is not a drive prefix", drive),
                    ));
                }
            }
        }

        let chart = &self.chart_patch;
        if !(chart.timebase.is_finite() && chart.timebase > 0.0) {
            return Err(ConfigError::invalid("chart_patch.timebase", chart.timebase));
        }
        if let Some(rate) = chart.refresh_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(ConfigError::invalid("chart_patch.refresh_rate", rate));
            }
        }

        Ok(())
    }

    pub fn token_seed(&self) -> Result<TokenSeed, ConfigError> {
        let mcode = |field: &'static str, value: &str| {
            value
                .parse::<Mcode>()
                .map_err(|e| ConfigError::invalid(field, e))
        };
        let id = |field: &'static str, value: &str| {
            if value.is_empty() {
                return Ok(None);
            }
            value
                .parse::<SecurityId>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(field, e))
        };

        Ok(TokenSeed {
            boot_version: mcode("security.boot_version", &self.security.boot_version)?,
            boot_seeds: self.security.boot_seeds,
            black_mcode: mcode("security.black_mcode", &self.security.black_mcode)?,
            white_mcode: self
                .security
                .white_mcode
                .as_deref()
                .map(|m| mcode("security.white_mcode", m))
                .transpose()?,
            pcbid: id("eamuse.pcbid", &self.eamuse.pcbid)?,
            eamid: id("eamuse.eamid", &self.eamuse.eamid)?,
        })
    }

    pub fn server_addr(&self) -> Result<ServerAddr, ConfigError> {
        self.eamuse
            .server
            .parse()
            .map_err(|e| ConfigError::invalid("eamuse.server", e))
    }

    /// Static card per slot.
    pub fn card_ids(&self) -> Result<Vec<Option<CardId>>, ConfigError> {
        self.card_reader
            .cards
            .iter()
            .map(|id| {
                if id.is_empty() {
                    Ok(None)
                } else {
                    id.parse()
                        .map(Some)
                        .map_err(|e| ConfigError::invalid("card_reader.cards", e))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "security": {{ "boot_version": "GEC02JAA", "boot_seeds": [1, 2, 3] }},
                "card_reader": {{ "port": "COM3", "cards": ["E004010000000001"] }},
                "chart_patch": {{ "enabled": true, "refresh_rate": 120.0 }}
            }}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.security.boot_seeds, [1, 2, 3]);
        assert_eq!(config.security.black_mcode, "GQC02JAA");
        assert_eq!(config.card_reader.port, "COM3");
        assert_eq!(config.card_reader.slots.len(), 2);
        assert_eq!(config.chart_patch.timebase, TIMEBASE_9_TO_13);

        let seed = config.token_seed().unwrap();
        assert_eq!(seed.boot_version.to_string(), "GEC02JAA");
        assert!(config.card_ids().unwrap()[0].is_some());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.security.black_mcode = "SHORT".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "security.black_mcode", .. })
        ));

        let mut config = Config::default();
        config.eamuse.pcbid = "not hex".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ezusb.vendor_id = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.card_reader.cards = vec!["123".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.eamuse.server = "localhost:notaport".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.settings.drives = vec!["dd".into()];
        assert!(config.validate().is_err());
    }
}
