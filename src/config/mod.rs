//! Configuration file management
//!
//! Loads TOML configuration and provides session settings.
//! Default config path: ~/.config/bseat/config.toml
//!
//! ```toml
//! [session]
//! backends = ["seatd", "direct", "noop"]   # or "seatd,noop"
//! seat = "seat0"
//!
//! [hotplug]
//! enabled = true
//! subsystems = ["drm", "input"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::constants::{BACKEND_ENV, DEFAULT_SEAT};
use crate::session::backend::BackendKind;

/// Library settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seat session settings
    pub session: SessionConfig,
    /// Hotplug monitor settings
    pub hotplug: HotplugConfig,
}

/// Seat session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend probe order; the first backend that opens a seat wins
    #[serde(deserialize_with = "deserialize_backends")]
    pub backends: Vec<BackendKind>,
    /// Seat name reported by the noop backend
    pub seat: String,
    /// Directory the noop backend resolves device paths against
    pub device_root: Option<PathBuf>,
    /// VT for the direct backend (detected from systemd/stdin if unset)
    pub vt: Option<u16>,
}

/// Hotplug monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    /// Subscribe to udev events at session creation
    pub enabled: bool,
    /// udev subsystems to watch
    pub subsystems: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backends: BackendKind::DEFAULT_ORDER.to_vec(),
            seat: DEFAULT_SEAT.to_string(),
            device_root: None,
            vt: None,
        }
    }
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subsystems: vec!["drm".to_string(), "input".to_string()],
        }
    }
}

impl SessionConfig {
    /// Probe order after applying the `BSEAT_BACKEND` override
    pub fn probe_order(&self) -> Vec<BackendKind> {
        match std::env::var(BACKEND_ENV) {
            Ok(value) => match parse_backend_list(&value) {
                Ok(order) if !order.is_empty() => {
                    info!("{} overrides backend order: {:?}", BACKEND_ENV, order);
                    order
                }
                Ok(_) => self.backends.clone(),
                Err(e) => {
                    warn!("Ignoring {}: {}", BACKEND_ENV, e);
                    self.backends.clone()
                }
            },
            Err(_) => self.backends.clone(),
        }
    }
}

/// Parse "seatd,direct,noop"
pub fn parse_backend_list(value: &str) -> std::result::Result<Vec<BackendKind>, String> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Backend list deserializer: accepts comma-separated string or array
fn deserialize_backends<'de, D>(deserializer: D) -> std::result::Result<Vec<BackendKind>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct BackendsVisitor;

    impl<'de> Visitor<'de> for BackendsVisitor {
        type Value = Vec<BackendKind>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of backend names")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_backend_list(value).map_err(E::custom)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut backends = Vec::new();
            while let Some(name) = seq.next_element::<String>()? {
                backends.push(name.parse().map_err(de::Error::custom)?);
            }
            Ok(backends)
        }
    }

    deserializer.deserialize_any(BackendsVisitor)
}

impl Config {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/bseat/config.toml";

    /// Get the path that would be used for loading config
    ///
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. BSEAT_CONFIG environment variable
        if let Ok(path) = std::env::var("BSEAT_CONFIG") {
            let p = Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/bseat/config.toml
        if let Some(config_path) = default_config_path() {
            if config_path.exists() {
                return Some(config_path);
            }
        }

        // 3. System config: /etc/bseat/config.toml
        let system_config = Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. BSEAT_CONFIG environment variable
    /// 2. ~/.config/bseat/config.toml (user config)
    /// 3. /etc/bseat/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

/// Get default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bseat").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(
            config.session.backends,
            vec![BackendKind::Seatd, BackendKind::Direct, BackendKind::Noop]
        );
        assert_eq!(config.session.seat, "seat0");
        assert!(config.hotplug.enabled);
        assert_eq!(config.hotplug.subsystems, vec!["drm", "input"]);
    }

    #[test]
    fn test_backends_as_array_or_string() {
        let config = Config::from_toml_str(
            r#"
            [session]
            backends = ["direct", "noop"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.session.backends,
            vec![BackendKind::Direct, BackendKind::Noop]
        );

        let config = Config::from_toml_str(
            r#"
            [session]
            backends = "logind, noop"
            seat = "seat1"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.session.backends,
            vec![BackendKind::Seatd, BackendKind::Noop]
        );
        assert_eq!(config.session.seat, "seat1");
        // Untouched tables keep their defaults
        assert!(config.hotplug.enabled);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Config::from_toml_str(
            r#"
            [session]
            backends = ["x11"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[session]\ndevice_root = \"/tmp/fake\"\nvt = 3\n[hotplug]\nenabled = false\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.session.device_root, Some(PathBuf::from("/tmp/fake")));
        assert_eq!(config.session.vt, Some(3));
        assert!(!config.hotplug.enabled);

        assert!(Config::load_from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_parse_backend_list() {
        assert_eq!(
            parse_backend_list("noop"),
            Ok(vec![BackendKind::Noop])
        );
        assert_eq!(parse_backend_list(""), Ok(vec![]));
        assert!(parse_backend_list("seatd,bogus").is_err());
    }
}
