//! Bridge configuration, stored as `bridge.conf` in `key=value` form.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs, io};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CHATBRIDGE_CONFIG";

/// Configuration shared by every instance of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Directory for engine state.
    pub data_dir: PathBuf,
    /// Logger filter used by hosts that do not pick their own.
    pub log_level: String,
    /// Capacity of each instance's incremental event channel.
    pub event_buffer: usize,
    /// Worker threads of the shared runtime.
    pub worker_threads: usize,
    /// Device name reported by the engine.
    pub device_name: String,
    /// Seconds between loopback `sync_status` heartbeats, `0` to disable.
    pub heartbeat_secs: u64,
}

/// Failure to read or interpret a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("read config {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A known key had a value that does not parse.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Base data directory (falls back to the working directory).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatbridge")
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".into(),
            event_buffer: 1024,
            worker_threads: 2,
            device_name: "chatbridge ffi".into(),
            heartbeat_secs: 0,
        }
    }
}

impl BridgeConfig {
    /// Where the config is read from: `$CHATBRIDGE_CONFIG`, else
    /// `<data_dir>/bridge.conf`.
    pub fn config_path() -> PathBuf {
        env::var_os(CONFIG_ENV).map_or_else(|| default_data_dir().join("bridge.conf"), PathBuf::from)
    }

    /// Load from [`Self::config_path`]. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds an invalid value.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds an invalid value.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Parse `key=value` lines. Blank lines, `#` comments and unknown keys are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a known key whose value does
    /// not parse.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let (k, v) = (k.trim(), v.trim());
            match k {
                "data_dir" => cfg.data_dir = PathBuf::from(v),
                "log_level" => v.clone_into(&mut cfg.log_level),
                "event_buffer" => cfg.event_buffer = positive(k, v)?,
                "worker_threads" => cfg.worker_threads = positive(k, v)?,
                "device_name" => v.clone_into(&mut cfg.device_name),
                "heartbeat_secs" => cfg.heartbeat_secs = number(k, v)?,
                _ => tracing::debug!(key = k, "Ignoring unknown config key"),
            }
        }
        Ok(cfg)
    }
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
    })
}

fn positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match number(key, value)? {
        0 => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
        }),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_gives_defaults() {
        let cfg = BridgeConfig::parse("").unwrap();
        assert_eq!(cfg, BridgeConfig::default());
        assert_eq!(cfg.event_buffer, 1024);
        assert_eq!(cfg.worker_threads, 2);
        assert_eq!(cfg.device_name, "chatbridge ffi");
    }

    #[test]
    fn known_keys_are_applied() {
        let cfg = BridgeConfig::parse(
            "# bridge settings\n\
             data_dir = /var/lib/chat\n\
             log_level=debug\n\
             event_buffer=16\n\
             worker_threads = 4\n\
             device_name = desk top\n\
             heartbeat_secs=5\n\
             colour=blue\n\
             not a pair\n",
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/chat"));
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.event_buffer, 16);
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.device_name, "desk top");
        assert_eq!(cfg.heartbeat_secs, 5);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = BridgeConfig::parse("event_buffer=lots").unwrap_err();
        assert_eq!(err.to_string(), r#"invalid value "lots" for event_buffer"#);
        assert!(BridgeConfig::parse("worker_threads=0").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BridgeConfig::load_from(&dir.path().join("bridge.conf")).unwrap();
        assert_eq!(cfg, BridgeConfig::default());
    }

    #[test]
    fn file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.conf");
        fs::write(&path, "heartbeat_secs=30\n").unwrap();
        assert_eq!(BridgeConfig::load_from(&path).unwrap().heartbeat_secs, 30);
    }
}
