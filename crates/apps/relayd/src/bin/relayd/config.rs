//! Flat `key=value` configuration file. This is the one place a
//! hand-rolled parser beats pulling in a format crate: the wire format is
//! mandated verbatim by the deployed fleet's provisioning tooling (a
//! handful of `KEY=value` lines, no nesting, no arrays), unlike
//! `reticulumd`'s own `DaemonConfig`, which parses full TOML because its
//! interface list is genuinely structured.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("config line {line} is not KEY=value: {text:?}")]
    Malformed { line: usize, text: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bridge_iface: String,
    pub mesh_channel: Option<String>,
    pub startup_delay_secs: u64,
    pub log_level: String,
    pub spool_root: PathBuf,
    pub observer_file: PathBuf,
    pub path_state_file: PathBuf,
    pub peer_directory_export: PathBuf,
    pub packet_event_log_export: PathBuf,
    pub dictionary_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bridge_iface: "br0".to_string(),
            mesh_channel: None,
            startup_delay_secs: relay_types::STARTUP_DELAY_SECS_DEFAULT,
            log_level: "info".to_string(),
            spool_root: PathBuf::from("/var/lib/relayd/spool"),
            observer_file: PathBuf::from("/var/lib/relayd/status.json"),
            path_state_file: PathBuf::from("/var/lib/relayd/node_modes.json"),
            peer_directory_export: PathBuf::from("/var/lib/relayd/peers.json"),
            packet_event_log_export: PathBuf::from("/var/lib/relayd/packet_events.json"),
            dictionary_path: None,
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_str(&contents)
    }

    fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let mut raw = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::Malformed { line: index + 1, text: line.to_string() });
            };
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut config = Config::default();
        if let Some(v) = raw.remove("BRIDGE_IFACE") {
            config.bridge_iface = v;
        }
        if let Some(v) = raw.remove("MESH_CHANNEL") {
            config.mesh_channel = Some(v);
        }
        if let Some(v) = raw.remove("STARTUP_DELAY_SECS") {
            config.startup_delay_secs = v.parse().map_err(|_| ConfigError::Malformed { line: 0, text: format!("STARTUP_DELAY_SECS={v}") })?;
        }
        if let Some(v) = raw.remove("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = raw.remove("SPOOL_ROOT") {
            config.spool_root = PathBuf::from(v);
        }
        if let Some(v) = raw.remove("OBSERVER_FILE") {
            config.observer_file = PathBuf::from(v);
        }
        if let Some(v) = raw.remove("PATH_STATE_FILE") {
            config.path_state_file = PathBuf::from(v);
        }
        if let Some(v) = raw.remove("PEER_DIRECTORY_EXPORT") {
            config.peer_directory_export = PathBuf::from(v);
        }
        if let Some(v) = raw.remove("PACKET_EVENT_LOG_EXPORT") {
            config.packet_event_log_export = PathBuf::from(v);
        }
        if let Some(v) = raw.remove("DICTIONARY_PATH") {
            config.dictionary_path = Some(PathBuf::from(v));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys_and_keeps_defaults_for_the_rest() {
        let config = Config::from_str("BRIDGE_IFACE=br-mesh\nSTARTUP_DELAY_SECS=5\n# a comment\n\nLOG_LEVEL=debug\n").unwrap();
        assert_eq!(config.bridge_iface, "br-mesh");
        assert_eq!(config.startup_delay_secs, 5);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.mesh_channel, None);
    }

    #[test]
    fn rejects_a_line_with_no_equals_sign() {
        let result = Config::from_str("BRIDGE_IFACE br0\n");
        assert!(matches!(result, Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn empty_file_yields_every_default() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.bridge_iface, "br0");
        assert_eq!(config.startup_delay_secs, relay_types::STARTUP_DELAY_SECS_DEFAULT);
    }
}
