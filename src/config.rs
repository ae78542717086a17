//! Daemon configuration
//!
//! Loaded from an optional YAML file. Every key has a default so a missing
//! file is a valid configuration; a file that exists but cannot be read or
//! parsed is an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "DRIVERD_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/driverd.yaml";
pub const DEFAULT_DATABASE_PATH: &str = "/usr/local/share/driverd/drivers.db";
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/devd.pipe";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Driver database file
    pub database: PathBuf,
    /// Linker hints files, searched in order
    pub hints_files: Vec<PathBuf>,
    pub id_databases: IdDatabaseConfig,
    pub socket: SocketConfig,
    /// Bounded waits before entering steady state
    pub startup_grace_ticks: u32,
    /// Modules never loaded, merged with `--exclude`
    pub exclude_kmods: Vec<String>,
    pub hooks: HookConfig,
    pub netstart: NetStartConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE_PATH),
            hints_files: pnp_hints::DEFAULT_HINTS_PATHS
                .iter()
                .map(PathBuf::from)
                .collect(),
            id_databases: IdDatabaseConfig::default(),
            socket: SocketConfig::default(),
            startup_grace_ticks: 2,
            exclude_kmods: Vec::new(),
            hooks: HookConfig::default(),
            netstart: NetStartConfig::default(),
        }
    }
}

/// Candidate pci.ids / usb.ids files; the first readable one wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdDatabaseConfig {
    pub pci: Vec<PathBuf>,
    pub usb: Vec<PathBuf>,
}

impl Default for IdDatabaseConfig {
    fn default() -> Self {
        Self {
            pci: vec![
                PathBuf::from("/usr/share/misc/pci_vendors"),
                PathBuf::from("/usr/local/share/pciids/pci.ids"),
            ],
            usb: vec![
                PathBuf::from("/usr/local/share/usbids/usb.ids"),
                PathBuf::from("/usr/share/misc/usb_vendors"),
            ],
        }
    }
}

/// Framing of the event socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Newline-delimited events over a stream socket
    #[default]
    Stream,
    /// One event per packet on a `SOCK_SEQPACKET` socket
    #[serde(alias = "datagram")]
    Seqpacket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
    pub transport: Transport,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
            transport: Transport::Stream,
            connect_attempts: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl SocketConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Executables backing the policy hook; unset entries are no-ops
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub init: Option<PathBuf>,
    pub on_add_device: Option<PathBuf>,
    pub affirm: Option<PathBuf>,
    pub on_load_kmod: Option<PathBuf>,
    pub on_finished: Option<PathBuf>,
}

impl HookConfig {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetStartConfig {
    pub command: PathBuf,
    /// Arguments; `{ifname}` is replaced with the interface name
    pub args: Vec<String>,
}

impl Default for NetStartConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/etc/rc.d/dhclient"),
            args: vec!["quietstart".to_string(), "{ifname}".to_string()],
        }
    }
}

impl DaemonConfig {
    /// Resolve the config path: explicit argument, then `DRIVERD_CONFIG`,
    /// then the default location.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate(path)?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            message: message.to_string(),
        };

        if self.database.as_os_str().is_empty() {
            return Err(invalid("database path is empty"));
        }
        if self.socket.connect_attempts == 0 {
            return Err(invalid("socket.connect_attempts must be at least 1"));
        }
        if self.exclude_kmods.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid("exclude_kmods contains an empty name"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::load(&dir.path().join("driverd.yaml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.socket.connect_attempts, 30);
        assert_eq!(config.socket.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.startup_grace_ticks, 2);
        assert_eq!(config.socket.transport, Transport::Stream);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let yaml = r#"
database: /tmp/drivers.db
exclude_kmods: [if_iwm, nvidia]
socket:
  transport: seqpacket
hooks:
  affirm: /usr/local/libexec/driverd-affirm
"#;
        let config = DaemonConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/drivers.db"));
        assert_eq!(config.exclude_kmods, vec!["if_iwm", "nvidia"]);
        assert_eq!(config.socket.transport, Transport::Seqpacket);
        assert_eq!(config.socket.path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(
            config.hooks.affirm,
            Some(PathBuf::from("/usr/local/libexec/driverd-affirm"))
        );
        assert!(config.hooks.init.is_none());
        assert_eq!(config.netstart, NetStartConfig::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(DaemonConfig::from_yaml("\n").unwrap(), DaemonConfig::default());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driverd.yaml");
        std::fs::write(&path, "socket: [not, a, map]\n").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));

        std::fs::write(&path, "databse: /typo\n").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driverd.yaml");
        std::fs::write(&path, "socket:\n  connect_attempts: 0\n").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_resolve_path_prefers_explicit() {
        let explicit = Path::new("/etc/driverd.yaml");
        assert_eq!(
            DaemonConfig::resolve_path(Some(explicit)),
            PathBuf::from("/etc/driverd.yaml")
        );
    }

    #[test]
    fn test_shipped_sample_parses() {
        let sample = include_str!("../config/driverd.yaml");
        let config = DaemonConfig::from_yaml(sample).unwrap();
        assert!(!config.hints_files.is_empty());
    }
}
