//! Configuration management for the tape daemon.
//!
//! Loads configuration from a TOML file; every field has a sensible
//! default so the daemon can start with no config at all.

use serde::Deserialize;
use std::path::PathBuf;

use crate::packer::PackerConfig;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub packer: PackerConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Virtual tape libraries available to backup jobs.
    #[serde(default)]
    pub library: Vec<LibraryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Daemon identifier, defaults to the hostname.
    #[serde(default = "default_daemon_id")]
    pub id: String,

    /// HTTP control-surface port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Working directory for media and state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory the static web UI is served from.
    #[serde(default = "default_webui_dir")]
    pub webui_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Directory-scan worker pool size.
    #[serde(default = "default_scan_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Bound of the scanner-to-packer source channel.
    #[serde(default = "default_source_queue_depth")]
    pub source_queue_depth: usize,

    /// Bound of the packer-to-postprocessor chunk channel.
    #[serde(default = "default_chunk_queue_depth")]
    pub chunk_queue_depth: usize,

    /// Bound of the writer's input queue.
    #[serde(default = "default_write_queue_depth")]
    pub write_queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    /// Display name of the library.
    pub name: String,

    /// Display name of its single drive.
    #[serde(default = "default_drive_name")]
    pub drive: String,

    /// Number of media slots.
    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Capacity of each medium in bytes.
    #[serde(default = "default_media_capacity")]
    pub media_capacity: u64,
}

fn default_daemon_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tape-daemon-01".to_string())
}

fn default_port() -> u16 {
    7890
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tape-daemon")
}

fn default_webui_dir() -> PathBuf {
    PathBuf::from("webui")
}

fn default_scan_workers() -> usize {
    4
}

fn default_source_queue_depth() -> usize {
    128
}

fn default_chunk_queue_depth() -> usize {
    4
}

fn default_write_queue_depth() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_drive_name() -> String {
    "Drive 0".to_string()
}

fn default_slots() -> usize {
    4
}

fn default_media_capacity() -> u64 {
    4 * 1024 * 1024 * 1024
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            id: default_daemon_id(),
            port: default_port(),
            data_dir: default_data_dir(),
            webui_dir: default_webui_dir(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: default_scan_workers(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_queue_depth: default_source_queue_depth(),
            chunk_queue_depth: default_chunk_queue_depth(),
            write_queue_depth: default_write_queue_depth(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// A default configuration carrying one virtual library, so a bare
    /// daemon is immediately usable.
    pub fn with_default_library() -> Self {
        let mut config = Config::default();
        config.library.push(LibraryConfig {
            name: "Virtual Library 0".to_string(),
            drive: default_drive_name(),
            slots: default_slots(),
            media_capacity: default_media_capacity(),
        });
        config
    }
}
